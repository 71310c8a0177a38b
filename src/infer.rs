//! Loading trained networks for inference

use std::path::Path;

use thiserror::Error;

use crate::{
    config::NetworkConfig,
    nn::{Mlp, NNError, StateDict},
};

#[derive(Debug, Error)]
pub enum InferError {
    #[error(transparent)]
    Network(#[from] NNError),
    #[error("Row {row} has width {got}, the network expects {expected}")]
    InputWidth {
        row: usize,
        expected: usize,
        got: usize,
    },
}

/// Network likelihood of both choices over a grid of reaction times
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodCurve {
    pub rts: Vec<f32>,
    /// choice `+1`
    pub upper: Vec<f32>,
    /// choice `-1`
    pub lower: Vec<f32>,
}

fn load_network(
    model_file_path: &Path,
    network_config: NetworkConfig,
    input_dim: usize,
) -> Result<Mlp, InferError> {
    let mut net = Mlp::new(network_config, input_dim)?;
    net.load_state_dict(&StateDict::load(model_file_path)?)?;
    log::info!(
        "Loaded {} network from '{}'",
        net.network_type(),
        model_file_path.display()
    );
    Ok(net)
}

fn call(net: &Mlp, x: &[f32]) -> Result<Vec<f32>, InferError> {
    if x.len() != net.input_dim() {
        return Err(InferError::InputWidth {
            row: 0,
            expected: net.input_dim(),
            got: x.len(),
        });
    }
    Ok(net.predict(x)?)
}

fn predict_on_batch(net: &Mlp, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, InferError> {
    x.iter()
        .enumerate()
        .map(|(row, values)| {
            call(net, values).map_err(|e| match e {
                InferError::InputWidth { expected, got, .. } => {
                    InferError::InputWidth { row, expected, got }
                }
                other => other,
            })
        })
        .collect()
}

/// Trained network in evaluation mode. A `cpn` network returns log-probabilities.
pub struct LoadMlpInfer {
    net: Mlp,
}

impl LoadMlpInfer {
    pub fn new(
        model_file_path: impl AsRef<Path>,
        network_config: NetworkConfig,
        input_dim: usize,
    ) -> Result<Self, InferError> {
        let mut net = load_network(model_file_path.as_ref(), network_config, input_dim)?;
        net.eval();
        Ok(Self { net })
    }

    pub fn network(&self) -> &Mlp {
        &self.net
    }

    pub fn call(&self, x: &[f32]) -> Result<Vec<f32>, InferError> {
        call(&self.net, x)
    }

    pub fn predict_on_batch(&self, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, InferError> {
        predict_on_batch(&self.net, x)
    }

    /// `exp` of the network output for `[theta..., rt, choice]` at every grid point
    pub fn likelihood_curve(
        &self,
        theta: &[f32],
        rt_grid: &[f32],
    ) -> Result<LikelihoodCurve, InferError> {
        let likelihood = |choice: f32| -> Result<Vec<f32>, InferError> {
            let rows: Vec<Vec<f32>> = rt_grid
                .iter()
                .map(|rt| {
                    let mut row = theta.to_vec();
                    row.extend([*rt, choice]);
                    row
                })
                .collect();
            Ok(self
                .predict_on_batch(&rows)?
                .into_iter()
                .map(|out| out.first().copied().unwrap_or(f32::NEG_INFINITY).exp())
                .collect())
        };
        Ok(LikelihoodCurve {
            rts: rt_grid.to_vec(),
            upper: likelihood(1.0)?,
            lower: likelihood(-1.0)?,
        })
    }
}

/// Trained network left in training mode, outputs are raw network outputs
pub struct LoadMlp {
    net: Mlp,
}

impl LoadMlp {
    pub fn new(
        model_file_path: impl AsRef<Path>,
        network_config: NetworkConfig,
        input_dim: usize,
    ) -> Result<Self, InferError> {
        let net = load_network(model_file_path.as_ref(), network_config, input_dim)?;
        Ok(Self { net })
    }

    pub fn network(&self) -> &Mlp {
        &self.net
    }

    pub fn into_network(self) -> Mlp {
        self.net
    }

    pub fn call(&self, x: &[f32]) -> Result<Vec<f32>, InferError> {
        call(&self.net, x)
    }

    pub fn predict_on_batch(&self, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, InferError> {
        predict_on_batch(&self.net, x)
    }
}
