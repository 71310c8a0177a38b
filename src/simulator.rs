//! Sequential sampling model simulators
//!
//! The training data generator only talks to the [`Simulator`] trait. The drift diffusion
//! model is provided as the reference implementation.

use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

/// Reaction time reported for trials which did not reach a boundary before `max_t`
pub const OMISSION_RT: f32 = -999.0;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Unknown simulator model `{0}`")]
    UnknownModel(String),
    #[error("Expected {expected} parameters, got {got}")]
    ParameterCount { expected: usize, got: usize },
    #[error("Parameter `{name}` = {value} is outside [{low}, {high}]")]
    ParameterOutOfBounds {
        name: &'static str,
        value: f32,
        low: f32,
        high: f32,
    },
}

/// Simulated trials for a single parameter vector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationOutput {
    pub rts: Vec<f32>,
    /// `1` for the upper boundary, `-1` for the lower one, `0` for omissions
    pub choices: Vec<i8>,
}

impl SimulationOutput {
    /// Iterates over the trials which reached a boundary
    pub fn responses(&self) -> impl Iterator<Item = (f32, i8)> + '_ {
        self.rts
            .iter()
            .zip(self.choices.iter())
            .filter(|(_, c)| **c != 0)
            .map(|(rt, c)| (*rt, *c))
    }

    /// Reaction times multiplied by the choice, the usual way of plotting both at once
    pub fn signed_rts(&self) -> Vec<f32> {
        self.responses().map(|(rt, c)| rt * c as f32).collect()
    }
}

/// A stochastic model of a two-alternative decision
pub trait Simulator {
    fn name(&self) -> &str;
    /// Parameter names in the order expected by [`Simulator::simulate`]
    fn param_names(&self) -> &[&'static str];
    /// Inclusive `(low, high)` bounds per parameter, used for sampling training parameters
    fn param_bounds(&self) -> &[(f32, f32)];
    fn max_t(&self) -> f32;
    fn simulate(
        &self,
        theta: &[f32],
        n_samples: usize,
        rng: &mut dyn RngCore,
    ) -> Result<SimulationOutput, SimulationError>;

    fn check_params(&self, theta: &[f32]) -> Result<(), SimulationError> {
        let bounds = self.param_bounds();
        if theta.len() != bounds.len() {
            return Err(SimulationError::ParameterCount {
                expected: bounds.len(),
                got: theta.len(),
            });
        }
        for ((value, (low, high)), name) in
            theta.iter().zip(bounds.iter()).zip(self.param_names())
        {
            if !(*low..=*high).contains(value) {
                return Err(SimulationError::ParameterOutOfBounds {
                    name: *name,
                    value: *value,
                    low: *low,
                    high: *high,
                });
            }
        }
        Ok(())
    }
}

/// Resolves a simulator by model identifier
pub fn simulator_for(
    model: &str,
    delta_t: f32,
    max_t: f32,
) -> Result<Box<dyn Simulator>, SimulationError> {
    match model {
        "ddm" => Ok(Box::new(Ddm::new(delta_t, max_t))),
        _ => Err(SimulationError::UnknownModel(model.to_string())),
    }
}

/// Drift diffusion model with parameters `v` (drift), `a` (boundary separation),
/// `z` (relative starting point) and `t` (non-decision time).
///
/// The evidence starts at `-a + 2az` and evolves as `dy = v dt + dW` until it leaves `[-a, a]`.
pub struct Ddm {
    delta_t: f32,
    max_t: f32,
}

const DDM_PARAMS: [&str; 4] = ["v", "a", "z", "t"];
const DDM_BOUNDS: [(f32, f32); 4] = [(-3.0, 3.0), (0.3, 2.5), (0.1, 0.9), (0.0, 2.0)];

impl Ddm {
    pub fn new(delta_t: f32, max_t: f32) -> Self {
        Self { delta_t, max_t }
    }
}

impl Simulator for Ddm {
    fn name(&self) -> &str {
        "ddm"
    }

    fn param_names(&self) -> &[&'static str] {
        &DDM_PARAMS
    }

    fn param_bounds(&self) -> &[(f32, f32)] {
        &DDM_BOUNDS
    }

    fn max_t(&self) -> f32 {
        self.max_t
    }

    fn simulate(
        &self,
        theta: &[f32],
        n_samples: usize,
        rng: &mut dyn RngCore,
    ) -> Result<SimulationOutput, SimulationError> {
        self.check_params(theta)?;
        let (v, a, z, t) = (theta[0], theta[1], theta[2], theta[3]);
        let sqrt_dt = self.delta_t.sqrt();
        let max_steps = (self.max_t / self.delta_t).ceil() as usize;

        let mut out = SimulationOutput {
            rts: Vec::with_capacity(n_samples),
            choices: Vec::with_capacity(n_samples),
        };
        for _ in 0..n_samples {
            let mut y = -a + 2.0 * a * z;
            let mut steps = 0;
            while y.abs() <= a && steps < max_steps {
                let noise: f32 = StandardNormal.sample(&mut *rng);
                y += v * self.delta_t + sqrt_dt * noise;
                steps += 1;
            }
            if y.abs() <= a {
                out.rts.push(OMISSION_RT);
                out.choices.push(0);
            } else {
                out.rts.push(steps as f32 * self.delta_t + t);
                out.choices.push(if y > 0.0 { 1 } else { -1 });
            }
        }
        Ok(out)
    }
}
