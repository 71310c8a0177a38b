//! Training loop driver
//!
//! [`ModelTrainer`] resolves the loss, optimizer and learning rate scheduler named in a
//! [`TrainConfig`], runs the epoch loop over a training and a validation [`DataLoader`] and
//! writes the trained artifacts next to each other:
//!
//! ```text
//! {output_folder}/{output_file_id}_{network_type}_{run_id}_training_history.csv
//! {output_folder}/{output_file_id}_{network_type}_{run_id}_train_state_dict.json
//! {output_folder}/{output_file_id}_{network_type}_{run_id}_train_config.json
//! {output_folder}/{output_file_id}_{network_type}_{run_id}_data_details.json
//! ```

use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{
    config::{ConfigError, LossKind, OptimizerKind, SchedulerKind, TrainConfig},
    dataloader::{Batch, DataLoader, DataLoaderError},
    loss::{compute_loss, compute_loss_f32},
    nn::{Mlp, Module, NNError, StateDict},
    optim::{Adam, ExponentialLR, LrScheduler, Optim, ReduceLROnPlateau, SGD},
    util::{UtilError, try_gen_folder, write_json},
    values::Value,
};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
    #[error(transparent)]
    Network(#[from] NNError),
    #[error(transparent)]
    Util(#[from] UtilError),
    #[error("Could not write '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{what} mismatch: the network expects {expected}, the data provides {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Where and what to save at the end of training
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub output_folder: PathBuf,
    pub output_file_id: String,
    pub run_id: String,
    pub save_history: bool,
    pub save_model: bool,
    pub save_config: bool,
    pub save_data_details: bool,
    /// Overrides the individual flags above
    pub save_all: bool,
    /// `0` silent, `1` logs every 100th batch, `2` every 1000th batch
    pub verbose: u8,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            output_folder: PathBuf::from("data/"),
            output_file_id: "fileid".to_string(),
            run_id: "runid".to_string(),
            save_history: true,
            save_model: true,
            save_config: true,
            save_data_details: true,
            save_all: true,
            verbose: 1,
        }
    }
}

impl TrainOptions {
    fn batch_log_interval(&self) -> Option<usize> {
        match self.verbose {
            0 => None,
            1 => Some(100),
            _ => Some(1000),
        }
    }
}

/// Validation loss per epoch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    pub val_loss: Vec<f32>,
}

impl TrainingHistory {
    pub fn to_csv(&self) -> String {
        let mut csv = String::from("epoch,val_loss\n");
        for (epoch, loss) in self.val_loss.iter().enumerate() {
            // writing into a String cannot fail
            let _ = writeln!(csv, "{epoch},{loss}");
        }
        csv
    }
}

/// Paths of the artifacts written by [`ModelTrainer::train_and_evaluate`]
#[derive(Debug, Clone, Default)]
pub struct TrainingArtifacts {
    pub history: Option<PathBuf>,
    pub state_dict: Option<PathBuf>,
    pub train_config: Option<PathBuf>,
    pub data_details: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct DataDetails<'a> {
    train_data_generator_config: Option<&'a JsonValue>,
    train_datafile_ids: &'a [PathBuf],
    valid_data_generator_config: Option<&'a JsonValue>,
    valid_datafile_ids: &'a [PathBuf],
}

/// Trains an [`Mlp`] on shard data
pub struct ModelTrainer {
    train_config: TrainConfig,
    model: Mlp,
    train_dl: DataLoader,
    valid_dl: DataLoader,
    optimizer: Box<dyn Optim>,
    scheduler: Option<Box<dyn LrScheduler>>,
    allow_abs_path_folder_generation: bool,
}

impl ModelTrainer {
    pub fn new(
        train_config: TrainConfig,
        model: Mlp,
        train_dl: DataLoader,
        valid_dl: DataLoader,
        allow_abs_path_folder_generation: bool,
    ) -> Result<Self, TrainError> {
        train_config.validate()?;
        for dl in [&train_dl, &valid_dl] {
            let dataset = dl.dataset();
            if dataset.input_dim() != model.input_dim() {
                return Err(TrainError::ShapeMismatch {
                    what: "input dimension",
                    expected: model.input_dim(),
                    got: dataset.input_dim(),
                });
            }
            if dataset.label_dim() != model.output_dim() {
                return Err(TrainError::ShapeMismatch {
                    what: "label dimension",
                    expected: model.output_dim(),
                    got: dataset.label_dim(),
                });
            }
        }

        let params = model.parameters();
        let optimizer: Box<dyn Optim> = match train_config.optimizer {
            OptimizerKind::Adam => Box::new(
                Adam::new(params, train_config.learning_rate)
                    .with_weight_decay(train_config.weight_decay),
            ),
            OptimizerKind::Sgd => Box::new(
                SGD::new(params, train_config.learning_rate, train_config.momentum)
                    .with_weight_decay(train_config.weight_decay),
            ),
        };
        let p = &train_config.lr_scheduler_params;
        let scheduler: Option<Box<dyn LrScheduler>> = match train_config.lr_scheduler {
            Some(SchedulerKind::ReduceOnPlateau) => Some(Box::new(ReduceLROnPlateau::new(
                p.factor,
                p.patience,
                p.threshold,
                p.min_lr,
                p.verbose,
            ))),
            Some(SchedulerKind::Multiply) => {
                Some(Box::new(ExponentialLR::new(p.factor, p.verbose)))
            }
            None => None,
        };

        Ok(Self {
            train_config,
            model,
            train_dl,
            valid_dl,
            optimizer,
            scheduler,
            allow_abs_path_folder_generation,
        })
    }

    /// Warm start from previously saved weights
    pub fn load_weights(&mut self, state_dict_path: &Path) -> Result<(), TrainError> {
        let state = StateDict::load(state_dict_path)?;
        self.model.load_state_dict(&state)?;
        log::info!("Loaded initial weights from '{}'", state_dict_path.display());
        Ok(())
    }

    pub fn model(&self) -> &Mlp {
        &self.model
    }

    pub fn into_model(self) -> Mlp {
        self.model
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.lr()
    }

    /// Runs all epochs, then saves the requested artifacts
    pub fn train_and_evaluate(
        &mut self,
        options: &TrainOptions,
    ) -> Result<(TrainingHistory, TrainingArtifacts), TrainError> {
        try_gen_folder(
            &options.output_folder,
            self.allow_abs_path_folder_generation,
        )?;

        let n_epochs = self.train_config.n_epochs;
        let log_interval = options.batch_log_interval();
        let mut history = TrainingHistory::default();
        self.model.train();

        for epoch in 0..n_epochs {
            let epoch_start = Instant::now();
            let n_batches = self.train_dl.len();
            for (cnt, batch) in self.train_dl.iter().enumerate() {
                let batch = batch?;
                let loss = batch_loss(&self.model, self.train_config.loss, &batch)?;
                loss.backward();
                self.optimizer.step();
                self.optimizer.zero_grad();

                if !loss.data().is_finite() {
                    log::warn!("Non-finite batch loss {} in epoch {}", loss.data(), epoch);
                }
                if log_interval.is_some_and(|every| cnt % every == 0) {
                    log::info!(
                        "epoch: {} / {}, batch: {} / {}, batch_loss: {}",
                        epoch,
                        n_epochs,
                        cnt,
                        n_batches,
                        loss.data()
                    );
                }
            }
            log::info!(
                "Epoch {} / {} took {:.2} seconds",
                epoch,
                n_epochs,
                epoch_start.elapsed().as_secs_f32()
            );

            let val_loss = self.validation_loss()?;
            log::info!(
                "epoch {} / {}, validation_loss: {:.4}",
                epoch,
                n_epochs,
                val_loss
            );
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.step(self.optimizer.as_mut(), val_loss);
            }
            history.val_loss.push(val_loss);
        }

        let artifacts = self.save(options, &history)?;
        log::info!("Training finished successfully");
        Ok((history, artifacts))
    }

    /// Mean of the per-batch validation losses, no computation graph is built
    fn validation_loss(&mut self) -> Result<f32, TrainError> {
        let mut total = 0.0;
        let mut n_batches = 0;
        for batch in self.valid_dl.iter() {
            let batch = batch?;
            let mut preds = Vec::with_capacity(batch.len() * self.model.output_dim());
            for row in &batch.features {
                preds.extend(self.model.predict(row)?);
            }
            let targets: Vec<f32> = batch.labels.iter().flatten().copied().collect();
            total += compute_loss_f32(self.train_config.loss, &preds, &targets);
            n_batches += 1;
        }
        Ok(total / n_batches.max(1) as f32)
    }

    fn save(
        &self,
        options: &TrainOptions,
        history: &TrainingHistory,
    ) -> Result<TrainingArtifacts, TrainError> {
        let full_path = options.output_folder.join(format!(
            "{}_{}_{}",
            options.output_file_id,
            self.model.network_type(),
            options.run_id
        ));
        let with_suffix = |suffix: &str| {
            let mut path = full_path.clone().into_os_string();
            path.push(suffix);
            PathBuf::from(path)
        };
        let mut artifacts = TrainingArtifacts::default();

        if options.save_history || options.save_all {
            let path = with_suffix("_training_history.csv");
            fs::write(&path, history.to_csv()).map_err(|source| TrainError::Io {
                path: path.display().to_string(),
                source,
            })?;
            log::info!("Saving training history to '{}'", path.display());
            artifacts.history = Some(path);
        }

        if options.save_model || options.save_all {
            let path = with_suffix("_train_state_dict.json");
            self.model.state_dict().save(&path)?;
            log::info!("Saving model parameters to '{}'", path.display());
            artifacts.state_dict = Some(path);
        }

        if options.save_config || options.save_all {
            let path = with_suffix("_train_config.json");
            write_json(&path, &self.train_config)?;
            log::info!("Saving training config to '{}'", path.display());
            artifacts.train_config = Some(path);
        }

        if options.save_data_details || options.save_all {
            let path = with_suffix("_data_details.json");
            let train = self.train_dl.dataset();
            let valid = self.valid_dl.dataset();
            write_json(
                &path,
                &DataDetails {
                    train_data_generator_config: train.data_generator_config(),
                    train_datafile_ids: train.file_ids(),
                    valid_data_generator_config: valid.data_generator_config(),
                    valid_datafile_ids: valid.file_ids(),
                },
            )?;
            log::info!("Saving training data details to '{}'", path.display());
            artifacts.data_details = Some(path);
        }

        Ok(artifacts)
    }
}

/// Graph-building loss over one batch, every output unit is compared to its label
fn batch_loss(model: &Mlp, loss: LossKind, batch: &Batch) -> Result<Value, TrainError> {
    let mut preds = Vec::with_capacity(batch.len() * model.output_dim());
    for row in &batch.features {
        let inputs: Vec<Value> = row.iter().map(|x| Value::new(*x)).collect();
        preds.extend(model.forward(&inputs)?);
    }
    let targets: Vec<Value> = batch
        .labels
        .iter()
        .flatten()
        .map(|y| Value::new(*y))
        .collect();
    Ok(compute_loss(loss, &preds, &targets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Activation, NetworkConfig, OutputType, load_json},
        dataloader::{DatasetOptions, loader_for},
        shards::{TrainingShard, shard_file_name, tests::scratch_dir, write_shard},
    };
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    /// Shards whose label is a smooth function of two features
    fn learnable_shards(dir: &Path, n_files: usize, rows: usize) -> Vec<PathBuf> {
        let mut rng = Pcg64Mcg::seed_from_u64(17);
        (0..n_files)
            .map(|f| {
                let data: Vec<Vec<f32>> = (0..rows)
                    .map(|_| vec![rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)])
                    .collect();
                let labels = data.iter().map(|x| 0.8 * x[0] - 0.5 * x[1] + 0.2).collect();
                let path = dir.join(shard_file_name("learn", f));
                write_shard(
                    &path,
                    &TrainingShard {
                        data,
                        labels,
                        generator_config: None,
                    },
                )
                .unwrap();
                path
            })
            .collect()
    }

    fn small_network() -> NetworkConfig {
        NetworkConfig {
            layer_sizes: vec![8, 1],
            activations: vec![Activation::Tanh, Activation::Linear],
            train_output_type: OutputType::Logprob,
        }
    }

    fn trainer_for(dir: &Path, train_config: TrainConfig) -> ModelTrainer {
        let files = learnable_shards(dir, 3, 64);
        let options = DatasetOptions {
            batch_size: 16,
            seed: Some(1),
            ..Default::default()
        };
        let train_dl = loader_for(&files[..2], options.clone(), true).unwrap();
        let valid_dl = loader_for(&files[2..], options, false).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let model = Mlp::with_rng(small_network(), 2, &mut rng).unwrap();
        ModelTrainer::new(train_config, model, train_dl, valid_dl, true).unwrap()
    }

    #[test]
    fn test_training_reduces_validation_loss() {
        let scratch = scratch_dir("trainer_reduces_loss");
        let dir = scratch.path();
        let config = TrainConfig {
            n_epochs: 8,
            learning_rate: 0.02,
            loss: LossKind::Mse,
            lr_scheduler: None,
            label_lower_bound: None,
            ..Default::default()
        };
        let mut trainer = trainer_for(dir, config);
        let options = TrainOptions {
            output_folder: dir.to_path_buf(),
            output_file_id: "ddm".to_string(),
            run_id: "test".to_string(),
            verbose: 0,
            ..Default::default()
        };
        let (history, artifacts) = trainer.train_and_evaluate(&options).unwrap();
        assert_eq!(history.val_loss.len(), 8);
        let first = history.val_loss[0];
        let last = *history.val_loss.last().unwrap();
        assert!(last < first, "validation loss went from {} to {}", first, last);

        let state_path = artifacts.state_dict.unwrap();
        assert!(state_path.ends_with("ddm_lan_test_train_state_dict.json"));
        let saved = StateDict::load(&state_path).unwrap();
        assert_eq!(saved, trainer.model().state_dict());

        let csv = fs::read_to_string(artifacts.history.unwrap()).unwrap();
        assert_eq!(csv.lines().count(), 9);
        assert!(csv.starts_with("epoch,val_loss\n0,"));

        let config: TrainConfig = load_json(artifacts.train_config.unwrap()).unwrap();
        assert_eq!(config.n_epochs, 8);

        let details: JsonValue = load_json(artifacts.data_details.unwrap()).unwrap();
        assert_eq!(details["train_datafile_ids"].as_array().unwrap().len(), 2);
        assert_eq!(details["valid_datafile_ids"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_selective_saving() {
        let scratch = scratch_dir("trainer_selective");
        let dir = scratch.path();
        let config = TrainConfig {
            n_epochs: 1,
            optimizer: OptimizerKind::Sgd,
            learning_rate: 0.01,
            lr_scheduler: Some(SchedulerKind::Multiply),
            ..Default::default()
        };
        let mut trainer = trainer_for(dir, config);
        let options = TrainOptions {
            output_folder: dir.join("out"),
            save_all: false,
            save_history: false,
            save_config: false,
            save_data_details: false,
            verbose: 0,
            ..Default::default()
        };
        let (_, artifacts) = trainer.train_and_evaluate(&options).unwrap();
        assert!(artifacts.state_dict.unwrap().exists());
        assert!(artifacts.history.is_none());
        assert!(artifacts.train_config.is_none());
        assert!(artifacts.data_details.is_none());
        // multiply scheduler with the default factor
        assert!((trainer.learning_rate() - 0.001).abs() < 1e-7);
    }

    #[test]
    fn test_warm_start() {
        let scratch = scratch_dir("trainer_warm_start");
        let dir = scratch.path();
        let config = TrainConfig {
            n_epochs: 1,
            ..Default::default()
        };
        let mut donor = trainer_for(dir, config.clone());
        let nothing_saved = TrainOptions {
            output_folder: dir.to_path_buf(),
            save_all: false,
            save_history: false,
            save_model: false,
            save_config: false,
            save_data_details: false,
            verbose: 0,
            ..Default::default()
        };
        donor.train_and_evaluate(&nothing_saved).unwrap();
        let path = dir.join("donor_state_dict.json");
        donor.model().state_dict().save(&path).unwrap();

        let mut trainer = trainer_for(dir, config);
        assert_ne!(trainer.model().state_dict(), donor.model().state_dict());
        trainer.load_weights(&path).unwrap();
        assert_eq!(
            trainer.into_model().state_dict(),
            donor.into_model().state_dict()
        );
    }

    #[test]
    fn test_shape_mismatch() {
        let scratch = scratch_dir("trainer_shape_mismatch");
        let dir = scratch.path();
        let files = learnable_shards(dir, 2, 32);
        let options = DatasetOptions {
            batch_size: 16,
            ..Default::default()
        };
        let train_dl = loader_for(&files[..1], options.clone(), false).unwrap();
        let valid_dl = loader_for(&files[1..], options, false).unwrap();
        let model = Mlp::new(small_network(), 3).unwrap();
        assert!(matches!(
            ModelTrainer::new(TrainConfig::default(), model, train_dl, valid_dl, true),
            Err(TrainError::ShapeMismatch {
                what: "input dimension",
                expected: 3,
                got: 2
            })
        ));
    }
}
