//! Training likelihood approximation networks (LANs) for sequential sampling models
//! with a small reverse-mode autograd engine and a PyTorch-like API.
//!
//! The workflow is: simulate a model and label reaction times with their KDE log-likelihood
//! ([`datagen`]), stream the resulting shards in mini batches ([`dataloader`]), fit an
//! [`nn::Mlp`] ([`trainer`]) and load the trained weights for evaluation ([`infer`]).

pub mod backprop_fns;
pub mod config;
pub mod dataloader;
pub mod datagen;
pub mod infer;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod plotting;
pub mod shards;
pub mod simulator;
pub mod trainer;
pub mod util;
pub mod values;
