//! Components to build a neural network

use std::{
    fs,
    path::Path,
    sync::atomic::{self, AtomicUsize},
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{Activation, ConfigError, NetworkConfig, OutputType},
    values::{Value, sigmoid},
};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected}, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("State dict does not match the network: {0}")]
    StateDictMismatch(String),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Malformed state dict: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Value>;
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError>;
}

/// A single neuron in a layer of a NN
pub struct Neuron {
    /// weights of the neuron
    pub weights: Vec<Value>,
    /// bias of the neuron
    pub bias: Value,
}

impl Neuron {
    /// Uniform initialization in `[-1/sqrt(n), 1/sqrt(n)]`, the PyTorch default for linear layers
    fn new<R: Rng + ?Sized>(n_inputs: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (n_inputs as f32).sqrt();
        let weights = (0..n_inputs)
            .map(|_| Value::new(rng.random_range(-bound..=bound)))
            .collect();
        Self {
            weights,
            bias: Value::new(rng.random_range(-bound..=bound)),
        }
    }

    // Testing utility for a deterministic and simple neuron
    #[cfg(test)]
    fn new_ones(n_inputs: usize) -> Self {
        Self {
            weights: (0..n_inputs).map(|_| Value::new(1.0)).collect(),
            bias: Value::new(1.0),
        }
    }

    pub fn parameters(&self) -> Vec<Value> {
        self.weights
            .iter()
            .chain(std::iter::once(&self.bias))
            .cloned()
            .collect()
    }

    pub fn forward(&self, inputs: &[Value]) -> Result<Value, NNError> {
        if inputs.len() != self.weights.len() {
            return Err(NNError::InputSizeMismatch {
                expected: self.weights.len(),
                got: inputs.len(),
            });
        }
        let output = self
            .weights
            .iter()
            .zip(inputs.iter())
            .map(|(w, i)| w * i)
            .sum::<Value>();
        let output = &output + &self.bias;
        Ok(output)
    }

    /// Forward pass on plain floats, no computation graph is built
    fn predict(&self, inputs: &[f32]) -> f32 {
        self.weights
            .iter()
            .zip(inputs.iter())
            .map(|(w, i)| w.data() * i)
            .sum::<f32>()
            + self.bias.data()
    }
}

/// A fully connected layer of a neural network
pub struct Layer {
    neurons: Vec<Neuron>,
    n_inputs: usize,
    n_output_nans: AtomicUsize,
}

impl Layer {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new(n_inputs: usize, n_outputs: usize) -> Self {
        Self::with_rng(n_inputs, n_outputs, &mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(n_inputs: usize, n_outputs: usize, rng: &mut R) -> Self {
        let neurons = (0..n_outputs).map(|_| Neuron::new(n_inputs, rng)).collect();
        Self {
            neurons,
            n_inputs,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    fn new_ones(n_inputs: usize, n_outputs: usize) -> Self {
        let neurons = (0..n_outputs).map(|_| Neuron::new_ones(n_inputs)).collect();
        Self {
            neurons,
            n_inputs,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.neurons.len()
    }

    /// Returns all the parameters in the layer
    pub fn parameters(&self) -> Vec<Value> {
        self.neurons.iter().flat_map(|n| n.parameters()).collect()
    }

    /// Computes forward pass for a layer
    pub fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let outputs = self
            .neurons
            .iter()
            .map(|n| n.forward(inputs))
            .collect::<Result<Vec<_>, _>>()?;
        let n_output_nans = outputs.iter().filter(|v| v.data().is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        if n_output_nans > 0 {
            log::debug!("n_output_nans: {}", n_output_nans);
        }
        Ok(outputs)
    }

    pub fn predict(&self, inputs: &[f32]) -> Result<Vec<f32>, NNError> {
        if inputs.len() != self.n_inputs {
            return Err(NNError::InputSizeMismatch {
                expected: self.n_inputs,
                got: inputs.len(),
            });
        }
        Ok(self.neurons.iter().map(|n| n.predict(inputs)).collect())
    }

    /// Number of NaN outputs in the most recent forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }

    fn state(&self) -> LinearState {
        LinearState {
            weight: self
                .neurons
                .iter()
                .map(|n| n.weights.iter().map(Value::data).collect())
                .collect(),
            bias: self.neurons.iter().map(|n| n.bias.data()).collect(),
        }
    }

    fn load_state(&mut self, state: &LinearState) -> Result<(), NNError> {
        if state.weight.len() != self.neurons.len() || state.bias.len() != self.neurons.len() {
            return Err(NNError::StateDictMismatch(format!(
                "expected {} output units, got {} weight rows and {} biases",
                self.neurons.len(),
                state.weight.len(),
                state.bias.len()
            )));
        }
        if let Some(row) = state.weight.iter().find(|row| row.len() != self.n_inputs) {
            return Err(NNError::StateDictMismatch(format!(
                "expected {} inputs per unit, got {}",
                self.n_inputs,
                row.len()
            )));
        }
        for ((neuron, row), bias) in self
            .neurons
            .iter_mut()
            .zip(state.weight.iter())
            .zip(state.bias.iter())
        {
            for (w, v) in neuron.weights.iter_mut().zip(row.iter()) {
                w.set_data(*v);
            }
            neuron.bias.set_data(*bias);
        }
        Ok(())
    }
}

impl Activation {
    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        match self {
            Activation::Relu => inputs.iter().map(Value::relu).collect(),
            Activation::Tanh => inputs.iter().map(Value::tanh).collect(),
            Activation::Sigmoid => inputs.iter().map(Value::sigmoid).collect(),
            Activation::Linear => inputs.to_vec(),
        }
    }

    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
            Activation::Linear => x,
        }
    }
}

/// Weights of one linear layer, `weight[unit][input]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearState {
    pub weight: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

/// Serializable snapshot of every linear layer of an [`Mlp`], in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub layers: Vec<LinearState>,
}

impl StateDict {
    pub fn save(&self, path: &Path) -> Result<(), NNError> {
        let json = serde_json::to_string(self)?;
        fs::write(path, json).map_err(|source| NNError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, NNError> {
        let json = fs::read_to_string(path).map_err(|source| NNError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

enum MlpLayer {
    Linear(Layer),
    Activation(Activation),
}

/// Multi-layer perceptron assembled from a [`NetworkConfig`]
pub struct Mlp {
    layers: Vec<MlpLayer>,
    input_dim: usize,
    network_config: NetworkConfig,
    training: bool,
}

impl Mlp {
    pub fn new(network_config: NetworkConfig, input_dim: usize) -> Result<Self, NNError> {
        Self::with_rng(network_config, input_dim, &mut rand::rng())
    }

    /// Builds `Linear -> activation` pairs for every hidden layer. The output layer only gets
    /// an activation when the config supplies one for it and it is not `linear`.
    pub fn with_rng<R: Rng + ?Sized>(
        network_config: NetworkConfig,
        input_dim: usize,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        network_config.validate()?;
        let sizes = &network_config.layer_sizes;
        let n_linear = sizes.len();
        let mut layers = Vec::with_capacity(2 * n_linear);
        let mut n_in = input_dim;
        for (i, &n_out) in sizes.iter().enumerate() {
            layers.push(MlpLayer::Linear(Layer::with_rng(n_in, n_out, rng)));
            let is_output = i + 1 == n_linear;
            match network_config.activations.get(i) {
                Some(Activation::Linear) if is_output => {}
                Some(activation) => layers.push(MlpLayer::Activation(*activation)),
                // validated above: only the output activation may be missing
                None => {}
            }
            n_in = n_out;
        }
        log::debug!(
            "Built MLP with input_dim {} and layer sizes {:?} ({} activations)",
            input_dim,
            sizes,
            network_config.activations.len()
        );
        Ok(Self {
            layers,
            input_dim,
            network_config,
            training: true,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.network_config.layer_sizes.last().copied().unwrap_or(0)
    }

    pub fn network_config(&self) -> &NetworkConfig {
        &self.network_config
    }

    pub fn train_output_type(&self) -> OutputType {
        self.network_config.train_output_type
    }

    /// Short tag of the network kind, `lan` or `cpn`
    pub fn network_type(&self) -> &'static str {
        self.train_output_type().network_type()
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Whether outputs are mapped from logits to log-probabilities
    fn outputs_log_probs(&self) -> bool {
        !self.training && self.train_output_type() == OutputType::Logits
    }

    /// Evaluates the network without building a computation graph
    pub fn predict(&self, inputs: &[f32]) -> Result<Vec<f32>, NNError> {
        let mut x = inputs.to_vec();
        for layer in &self.layers {
            x = match layer {
                MlpLayer::Linear(linear) => linear.predict(&x)?,
                MlpLayer::Activation(activation) => {
                    x.iter().map(|v| activation.apply(*v)).collect()
                }
            };
        }
        if self.outputs_log_probs() {
            x = x.into_iter().map(log_sigmoid).collect();
        }
        Ok(x)
    }

    pub fn state_dict(&self) -> StateDict {
        StateDict {
            layers: self.linear_layers().map(Layer::state).collect(),
        }
    }

    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<(), NNError> {
        let n_linear = self.linear_layers().count();
        if state.layers.len() != n_linear {
            return Err(NNError::StateDictMismatch(format!(
                "expected {} linear layers, got {}",
                n_linear,
                state.layers.len()
            )));
        }
        let linear = self.layers.iter_mut().filter_map(|layer| match layer {
            MlpLayer::Linear(linear) => Some(linear),
            MlpLayer::Activation(_) => None,
        });
        for (layer, layer_state) in linear.zip(state.layers.iter()) {
            layer.load_state(layer_state)?;
        }
        Ok(())
    }

    fn linear_layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter().filter_map(|layer| match layer {
            MlpLayer::Linear(linear) => Some(linear),
            MlpLayer::Activation(_) => None,
        })
    }
}

impl Module for Mlp {
    fn parameters(&self) -> Vec<Value> {
        self.linear_layers().flat_map(Layer::parameters).collect()
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let mut x = inputs.to_vec();
        for layer in &self.layers {
            x = match layer {
                MlpLayer::Linear(linear) => linear.forward(&x)?,
                MlpLayer::Activation(activation) => activation.forward(&x),
            };
        }
        if self.outputs_log_probs() {
            // log(sigmoid(x)) = -(relu(-x) + ln(1 + exp(-|x|)))
            x = x
                .iter()
                .map(|v| {
                    let neg = -v;
                    let softplus = &neg.relu() + &(&Value::new(1.0) + &(-&v.abs()).exp()).ln();
                    -&softplus
                })
                .collect();
        }
        Ok(x)
    }
}

/// `ln(1 / (1 + exp(-x)))`, stable for large `|x|`
pub fn log_sigmoid(x: f32) -> f32 {
    -((-x).max(0.0) + (-x.abs()).exp().ln_1p())
}
