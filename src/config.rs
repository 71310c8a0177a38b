//! Configuration records for data generation, network architecture and training
//!
//! Every record has a `Default` matching the values used in the tutorial workflow, serializes
//! to JSON, and can be loaded back with [`load_json`].

use std::{
    fmt::{self, Display},
    fs,
    path::Path,
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Errors for configuration handling
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Element-wise activation applied after a linear layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
    Linear,
}

impl Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Relu => write!(f, "relu"),
            Activation::Tanh => write!(f, "tanh"),
            Activation::Sigmoid => write!(f, "sigmoid"),
            Activation::Linear => write!(f, "linear"),
        }
    }
}

/// What the network output represents.
///
/// `Logprob` networks (LANs) regress log-likelihoods directly. `Logits` networks (CPNs) are
/// trained on logits and report log-probabilities at inference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    Logprob,
    Logits,
}

impl OutputType {
    /// Short network type tag used in artifact file names
    pub fn network_type(&self) -> &'static str {
        match self {
            OutputType::Logprob => "lan",
            OutputType::Logits => "cpn",
        }
    }
}

/// Architecture of a multi-layer perceptron
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Output width of each linear layer, the last entry is the output dimension
    pub layer_sizes: Vec<usize>,
    /// Activation after each linear layer. The entry for the output layer is optional.
    pub activations: Vec<Activation>,
    #[serde(default)]
    pub train_output_type: OutputType,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            layer_sizes: vec![100, 100, 1],
            activations: vec![Activation::Tanh, Activation::Tanh, Activation::Linear],
            train_output_type: OutputType::Logprob,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.layer_sizes.is_empty() {
            return Err(ConfigError::invalid("layer_sizes", "must not be empty"));
        }
        if self.layer_sizes.contains(&0) {
            return Err(ConfigError::invalid(
                "layer_sizes",
                "every layer needs at least one unit",
            ));
        }
        // every hidden layer needs an activation, the output one may be omitted
        if self.activations.len() + 1 < self.layer_sizes.len() {
            return Err(ConfigError::invalid(
                "activations",
                format!(
                    "expected at least {} activations for {} layers, got {}",
                    self.layer_sizes.len() - 1,
                    self.layer_sizes.len(),
                    self.activations.len()
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    Huber,
    Mse,
    Bce,
    Bcelogit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Scale the learning rate down when the validation loss stops improving
    ReduceOnPlateau,
    /// Scale the learning rate by a constant factor after every epoch
    Multiply,
}

/// Parameters shared by the learning rate schedulers, unused fields are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerParams {
    pub factor: f32,
    pub patience: usize,
    pub threshold: f32,
    pub min_lr: f32,
    pub verbose: bool,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            factor: 0.1,
            patience: 2,
            threshold: 0.001,
            min_lr: 1e-8,
            verbose: true,
        }
    }
}

/// Hyperparameters of the training loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub n_epochs: usize,
    pub optimizer: OptimizerKind,
    pub learning_rate: f32,
    pub weight_decay: f32,
    /// Only used by SGD
    pub momentum: f32,
    pub loss: LossKind,
    pub lr_scheduler: Option<SchedulerKind>,
    pub lr_scheduler_params: SchedulerParams,
    pub label_lower_bound: Option<f32>,
    pub label_upper_bound: Option<f32>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            n_epochs: 20,
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.001,
            weight_decay: 0.0,
            momentum: 0.0,
            loss: LossKind::Huber,
            lr_scheduler: Some(SchedulerKind::ReduceOnPlateau),
            lr_scheduler_params: SchedulerParams::default(),
            label_lower_bound: Some(1e-10f32.ln()),
            label_upper_bound: None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be positive"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::invalid("learning_rate", "must be positive"));
        }
        if self.weight_decay < 0.0 {
            return Err(ConfigError::invalid("weight_decay", "must not be negative"));
        }
        if let (Some(lo), Some(hi)) = (self.label_lower_bound, self.label_upper_bound) {
            if lo > hi {
                return Err(ConfigError::invalid(
                    "label_lower_bound",
                    format!("lower bound {lo} exceeds upper bound {hi}"),
                ));
            }
        }
        Ok(())
    }
}

/// Settings for generating LAN training data from a simulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataGeneratorConfig {
    /// Simulator identifier, see [`crate::simulator::simulator_for`]
    pub model: String,
    /// Parameter vectors drawn per generation run, split evenly over the shards
    pub n_parameter_sets: usize,
    /// Simulated trials per parameter vector
    pub n_simulations: usize,
    /// Labeled training examples drawn per parameter vector
    pub n_training_samples_by_parameter_set: usize,
    pub n_files: usize,
    pub delta_t: f32,
    pub max_t: f32,
    /// Mixture weights for KDE samples, uniform rts, and negative rts
    pub data_mixture_probabilities: [f32; 3],
    /// Label assigned to impossible observations
    pub negative_rt_label: f32,
    pub output_folder: String,
    pub run_id: String,
    pub seed: u64,
}

impl Default for DataGeneratorConfig {
    fn default() -> Self {
        Self {
            model: "ddm".to_string(),
            n_parameter_sets: 100,
            n_simulations: 1000,
            n_training_samples_by_parameter_set: 1000,
            n_files: 4,
            delta_t: 0.001,
            max_t: 20.0,
            data_mixture_probabilities: [0.8, 0.1, 0.1],
            negative_rt_label: -66.774,
            output_folder: "data/lan_mlp".to_string(),
            run_id: "run".to_string(),
            seed: 0,
        }
    }
}

impl DataGeneratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_files == 0 {
            return Err(ConfigError::invalid("n_files", "must be positive"));
        }
        // the loader derives batches per file from the first shard, so shards must be equal
        if self.n_parameter_sets == 0 || self.n_parameter_sets % self.n_files != 0 {
            return Err(ConfigError::invalid(
                "n_parameter_sets",
                format!("must be a positive multiple of n_files ({})", self.n_files),
            ));
        }
        if self.n_simulations == 0 || self.n_training_samples_by_parameter_set == 0 {
            return Err(ConfigError::invalid(
                "n_simulations",
                "simulation and sample counts must be positive",
            ));
        }
        if !(self.delta_t > 0.0) || !(self.max_t > self.delta_t) {
            return Err(ConfigError::invalid(
                "delta_t",
                "requires 0 < delta_t < max_t",
            ));
        }
        let mix = self.data_mixture_probabilities;
        if mix.iter().any(|p| *p < 0.0) || (mix.iter().sum::<f32>() - 1.0).abs() > 1e-4 {
            return Err(ConfigError::invalid(
                "data_mixture_probabilities",
                "must be non-negative and sum to 1",
            ));
        }
        if self.run_id.is_empty() || self.run_id.contains(['/', '\\']) {
            return Err(ConfigError::invalid(
                "run_id",
                "must be a non-empty file name fragment",
            ));
        }
        Ok(())
    }
}

/// Reads any of the config records from a JSON file
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&json)?)
}
