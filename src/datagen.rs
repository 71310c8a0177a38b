//! Generates LAN training data from a simulator
//!
//! For every sampled parameter vector the simulator is run, a kernel density estimate is fit
//! to the simulated reaction times of each choice, and training examples are drawn from a
//! mixture of KDE samples, uniform reaction times and impossible (negative) reaction times.
//! Each example is `[theta..., rt, choice]` labeled with its log-likelihood under the KDE.

use std::path::PathBuf;

use rand::{Rng, RngCore, SeedableRng, seq::IndexedRandom};
use rand_distr::{Distribution, StandardNormal};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    config::{ConfigError, DataGeneratorConfig},
    shards::{ShardError, TrainingShard, shard_file_name, write_shard},
    simulator::{SimulationError, SimulationOutput, Simulator, simulator_for},
    util::{UtilError, try_gen_folder},
};

#[derive(Debug, Error)]
pub enum DataGenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Folder(#[from] UtilError),
}

/// Gaussian kernel density estimate over the reaction times of one choice
#[derive(Debug, Clone)]
pub struct ChoiceKde {
    rts: Vec<f32>,
    bandwidth: f32,
    /// Share of all simulated trials which ended with this choice
    weight: f32,
}

const MIN_BANDWIDTH: f32 = 1e-3;

impl ChoiceKde {
    /// Fits a KDE with Silverman's rule of thumb bandwidth
    pub fn fit(rts: Vec<f32>, n_total: usize) -> Self {
        let n = rts.len();
        let weight = if n_total == 0 {
            0.0
        } else {
            n as f32 / n_total as f32
        };
        let bandwidth = if n < 2 {
            MIN_BANDWIDTH
        } else {
            let mean = rts.iter().sum::<f32>() / n as f32;
            let var = rts.iter().map(|rt| (rt - mean).powi(2)).sum::<f32>() / (n - 1) as f32;
            (1.06 * var.sqrt() * (n as f32).powf(-0.2)).max(MIN_BANDWIDTH)
        };
        Self {
            rts,
            bandwidth,
            weight,
        }
    }

    pub fn bandwidth(&self) -> f32 {
        self.bandwidth
    }

    /// Density of `rt` jointly with this choice
    pub fn density(&self, rt: f32) -> f32 {
        if self.rts.is_empty() {
            return 0.0;
        }
        let h = self.bandwidth;
        let norm = 1.0 / ((2.0 * std::f32::consts::PI).sqrt() * h * self.rts.len() as f32);
        let kernel_sum: f32 = self
            .rts
            .iter()
            .map(|x| {
                let u = (rt - x) / h;
                (-0.5 * u * u).exp()
            })
            .sum();
        self.weight * norm * kernel_sum
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Option<f32> {
        let center = self.rts.choose(&mut *rng)?;
        let noise: f32 = StandardNormal.sample(&mut *rng);
        Some(center + self.bandwidth * noise)
    }
}

/// KDE based likelihood of both choices of a simulated dataset
#[derive(Debug, Clone)]
pub struct LikelihoodKde {
    upper: ChoiceKde,
    lower: ChoiceKde,
}

impl LikelihoodKde {
    pub fn fit(sims: &SimulationOutput) -> Self {
        let n_total = sims.rts.len();
        let (upper, lower): (Vec<_>, Vec<_>) = sims.responses().partition(|(_, c)| *c > 0);
        Self {
            upper: ChoiceKde::fit(upper.into_iter().map(|(rt, _)| rt).collect(), n_total),
            lower: ChoiceKde::fit(lower.into_iter().map(|(rt, _)| rt).collect(), n_total),
        }
    }

    fn for_choice(&self, choice: f32) -> &ChoiceKde {
        if choice > 0.0 { &self.upper } else { &self.lower }
    }

    /// Log-likelihood of `(rt, choice)`, floored at `floor`. Non-positive rts get `floor`.
    pub fn log_likelihood(&self, rt: f32, choice: f32, floor: f32) -> f32 {
        if rt <= 0.0 {
            return floor;
        }
        let density = self.for_choice(choice).density(rt);
        if density > 0.0 {
            density.ln().max(floor)
        } else {
            floor
        }
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Option<(f32, f32)> {
        let n_upper = self.upper.rts.len();
        let n_lower = self.lower.rts.len();
        if n_upper + n_lower == 0 {
            return None;
        }
        if rng.random_range(0..n_upper + n_lower) < n_upper {
            self.upper.sample(rng).map(|rt| (rt, 1.0))
        } else {
            self.lower.sample(rng).map(|rt| (rt, -1.0))
        }
    }
}

/// Drives a [`Simulator`] to produce training shards
pub struct DataGenerator {
    config: DataGeneratorConfig,
    simulator: Box<dyn Simulator>,
}

impl DataGenerator {
    pub fn new(config: DataGeneratorConfig) -> Result<Self, DataGenError> {
        config.validate()?;
        let simulator = simulator_for(&config.model, config.delta_t, config.max_t)?;
        Ok(Self { config, simulator })
    }

    /// Uses a custom simulator instead of resolving `config.model`
    pub fn with_simulator(
        config: DataGeneratorConfig,
        simulator: Box<dyn Simulator>,
    ) -> Result<Self, DataGenError> {
        config.validate()?;
        Ok(Self { config, simulator })
    }

    pub fn config(&self) -> &DataGeneratorConfig {
        &self.config
    }

    pub fn simulator(&self) -> &dyn Simulator {
        self.simulator.as_ref()
    }

    /// Draws a parameter vector uniformly within the simulator bounds
    pub fn sample_parameters(&self, rng: &mut dyn RngCore) -> Vec<f32> {
        self.simulator
            .param_bounds()
            .iter()
            .map(|(low, high)| rng.random_range(*low..=*high))
            .collect()
    }

    /// Simulates `theta` and returns labeled training rows for it
    pub fn training_examples(
        &self,
        theta: &[f32],
        rng: &mut dyn RngCore,
    ) -> Result<(Vec<Vec<f32>>, Vec<f32>), DataGenError> {
        let sims = self
            .simulator
            .simulate(theta, self.config.n_simulations, rng)?;
        let kde = LikelihoodKde::fit(&sims);
        let [p_kde, p_uniform, _] = self.config.data_mixture_probabilities;
        let floor = self.config.negative_rt_label;
        let max_t = self.simulator.max_t();

        let n = self.config.n_training_samples_by_parameter_set;
        let mut rows = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for _ in 0..n {
            let u: f32 = rng.random();
            let kde_sample = if u < p_kde { kde.sample(rng) } else { None };
            let (rt, choice) = match kde_sample {
                Some(sample) => sample,
                // all trials omitted also falls back to uniform samples
                None if u < p_kde + p_uniform => {
                    (rng.random_range(f32::EPSILON..=max_t), random_choice(rng))
                }
                None => (-rng.random_range(f32::EPSILON..=2.0), random_choice(rng)),
            };
            let label = kde.log_likelihood(rt, choice, floor);
            let mut row = theta.to_vec();
            row.push(rt);
            row.push(choice);
            rows.push(row);
            labels.push(label);
        }
        Ok((rows, labels))
    }

    /// Generates all shards of the run and returns their paths in index order
    pub fn generate(&self) -> Result<Vec<PathBuf>, DataGenError> {
        let folder = PathBuf::from(&self.config.output_folder);
        try_gen_folder(&folder, true)?;

        let mut rng = Pcg64Mcg::seed_from_u64(self.config.seed);
        let sets_per_file = self.config.n_parameter_sets / self.config.n_files;
        let mut paths = Vec::with_capacity(self.config.n_files);
        for file_idx in 0..self.config.n_files {
            let mut data = Vec::new();
            let mut labels = Vec::new();
            for _ in 0..sets_per_file {
                let theta = self.sample_parameters(&mut rng);
                let (rows, row_labels) = self.training_examples(&theta, &mut rng)?;
                data.extend(rows);
                labels.extend(row_labels);
            }
            let path = folder.join(shard_file_name(&self.config.run_id, file_idx));
            write_shard(
                &path,
                &TrainingShard {
                    data,
                    labels,
                    generator_config: Some(self.config.clone()),
                },
            )?;
            log::info!(
                "Generated shard {} / {}: '{}'",
                file_idx + 1,
                self.config.n_files,
                path.display()
            );
            paths.push(path);
        }
        Ok(paths)
    }
}

fn random_choice(rng: &mut dyn RngCore) -> f32 {
    if rng.random_bool(0.5) { 1.0 } else { -1.0 }
}

/// Simulates `theta` with a seeded RNG, used for ground-truth comparisons
pub fn simulate_seeded(
    simulator: &dyn Simulator,
    theta: &[f32],
    n_samples: usize,
    seed: u64,
) -> Result<SimulationOutput, SimulationError> {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    simulator.simulate(theta, n_samples, &mut rng)
}
