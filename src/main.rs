//! Command line front end for `lan_factory`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- generate --n-parameter-sets 40 --n-files 4
//! cargo run -- train --data-folder data/lan_mlp --n-epochs 5 --plot
//! cargo run -- compare --state-dict data/torch_models/ddm_lan_run_train_state_dict.json \
//!     --network-config data/torch_models/ddm_lan_run_network_config.json --theta 0.5,1.2,0.5,0.3
//! ```
//!
//! Every subcommand accepts `--config <json>`, flags given on the command line take precedence.

use std::{error::Error, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use lan_factory::{
    config::{
        DataGeneratorConfig, LossKind, NetworkConfig, OptimizerKind, OutputType, TrainConfig,
        load_json,
    },
    dataloader::{DatasetOptions, loader_for, split_train_valid},
    datagen::{DataGenerator, simulate_seeded},
    infer::LoadMlpInfer,
    nn::Mlp,
    plotting::{plot_likelihood_comparison, plot_training_history},
    shards::discover_shards,
    simulator::simulator_for,
    trainer::{ModelTrainer, TrainOptions},
    util::save_configs,
};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
#[command(about = "Generate training data for, train and check likelihood approximation networks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Simulate a model and write labeled training shards
    Generate(GenerateArgs),
    /// Train a network on previously generated shards
    Train(TrainArgs),
    /// Plot a trained network against fresh simulations
    Compare(CompareArgs),
}

#[derive(Args)]
struct GenerateArgs {
    /// Data generator config (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    n_parameter_sets: Option<usize>,
    #[arg(long)]
    n_simulations: Option<usize>,
    #[arg(long)]
    n_training_samples_by_parameter_set: Option<usize>,
    #[arg(long)]
    n_files: Option<usize>,
    #[arg(long)]
    output_folder: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct TrainArgs {
    /// Train config (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Network config (JSON)
    #[arg(long)]
    network_config: Option<PathBuf>,
    #[arg(long, default_value = "data/lan_mlp")]
    data_folder: PathBuf,
    /// Run id of the shards to train on
    #[arg(long, default_value = "run")]
    data_run_id: String,
    /// Share of shard files held out for validation
    #[arg(long, default_value_t = 0.1)]
    valid_fraction: f32,
    #[arg(long)]
    n_epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f32>,
    #[arg(long, value_enum)]
    optimizer: Option<OptimizerKind>,
    #[arg(long, value_enum)]
    loss: Option<LossKind>,
    /// Comma separated, e.g. `100,100,1`
    #[arg(long, value_delimiter = ',')]
    layer_sizes: Option<Vec<usize>>,
    #[arg(long, value_enum)]
    train_output_type: Option<OutputType>,
    /// Warm start from a saved state dict
    #[arg(long)]
    initial_state_dict: Option<PathBuf>,
    #[arg(long, default_value = "data/torch_models")]
    output_folder: PathBuf,
    #[arg(long, default_value = "ddm")]
    output_file_id: String,
    #[arg(long, default_value = "run")]
    run_id: String,
    #[arg(long, default_value_t = false)]
    allow_abs_path_folder_generation: bool,
    /// Seeds weight initialization and bootstrap resampling
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = 1)]
    verbose: u8,
    /// Also plot the validation loss
    #[arg(long, default_value_t = false)]
    plot: bool,
}

#[derive(Args)]
struct CompareArgs {
    #[arg(long)]
    state_dict: PathBuf,
    #[arg(long)]
    network_config: PathBuf,
    #[arg(long, default_value = "ddm")]
    model: String,
    /// Comma separated model parameters
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true, required = true)]
    theta: Vec<f32>,
    #[arg(long, default_value_t = 10_000)]
    n_samples: usize,
    #[arg(long, default_value_t = 0.001)]
    delta_t: f32,
    #[arg(long, default_value_t = 20.0)]
    max_t: f32,
    #[arg(long, default_value_t = 200)]
    n_grid: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value = "likelihood_comparison.png")]
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    match Cli::parse().command {
        Command::Generate(args) => generate(args),
        Command::Train(args) => train(args),
        Command::Compare(args) => compare(args),
    }
}

fn generate(args: GenerateArgs) -> Result<(), Box<dyn Error>> {
    let mut config: DataGeneratorConfig = match &args.config {
        Some(path) => load_json(path)?,
        None => DataGeneratorConfig::default(),
    };
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(n) = args.n_parameter_sets {
        config.n_parameter_sets = n;
    }
    if let Some(n) = args.n_simulations {
        config.n_simulations = n;
    }
    if let Some(n) = args.n_training_samples_by_parameter_set {
        config.n_training_samples_by_parameter_set = n;
    }
    if let Some(n) = args.n_files {
        config.n_files = n;
    }
    if let Some(folder) = args.output_folder {
        config.output_folder = folder;
    }
    if let Some(run_id) = args.run_id {
        config.run_id = run_id;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let paths = DataGenerator::new(config)?.generate()?;
    log::info!("Wrote {} training shards", paths.len());
    Ok(())
}

fn train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let mut train_config: TrainConfig = match &args.config {
        Some(path) => load_json(path)?,
        None => TrainConfig::default(),
    };
    if let Some(n) = args.n_epochs {
        train_config.n_epochs = n;
    }
    if let Some(n) = args.batch_size {
        train_config.batch_size = n;
    }
    if let Some(lr) = args.learning_rate {
        train_config.learning_rate = lr;
    }
    if let Some(optimizer) = args.optimizer {
        train_config.optimizer = optimizer;
    }
    if let Some(loss) = args.loss {
        train_config.loss = loss;
    }

    let mut network_config: NetworkConfig = match &args.network_config {
        Some(path) => load_json(path)?,
        None => NetworkConfig::default(),
    };
    if let Some(sizes) = args.layer_sizes {
        network_config.layer_sizes = sizes;
    }
    if let Some(output_type) = args.train_output_type {
        network_config.train_output_type = output_type;
    }

    let files = discover_shards(&args.data_folder, &args.data_run_id)?;
    let (train_files, valid_files) = split_train_valid(&files, args.valid_fraction)?;
    log::info!(
        "Training on {} shards, validating on {}",
        train_files.len(),
        valid_files.len()
    );
    let dataset_options = DatasetOptions {
        batch_size: train_config.batch_size,
        label_lower_bound: train_config.label_lower_bound,
        label_upper_bound: train_config.label_upper_bound,
        seed: args.seed,
        ..Default::default()
    };
    let train_dl = loader_for(&train_files, dataset_options.clone(), true)?;
    let valid_dl = loader_for(&valid_files, dataset_options, false)?;

    let input_dim = train_dl.dataset().input_dim();
    let model = match args.seed {
        Some(seed) => Mlp::with_rng(
            network_config.clone(),
            input_dim,
            &mut Pcg64Mcg::seed_from_u64(seed),
        )?,
        None => Mlp::new(network_config.clone(), input_dim)?,
    };
    let model_id = format!(
        "{}_{}_{}",
        args.output_file_id,
        model.network_type(),
        args.run_id
    );
    save_configs(
        &model_id,
        &args.output_folder,
        &network_config,
        &train_config,
        args.allow_abs_path_folder_generation,
    )?;

    let mut trainer = ModelTrainer::new(
        train_config,
        model,
        train_dl,
        valid_dl,
        args.allow_abs_path_folder_generation,
    )?;
    if let Some(path) = &args.initial_state_dict {
        trainer.load_weights(path)?;
    }
    let options = TrainOptions {
        output_folder: args.output_folder.clone(),
        output_file_id: args.output_file_id,
        run_id: args.run_id,
        save_all: false,
        // already written by save_configs
        save_config: false,
        verbose: args.verbose,
        ..Default::default()
    };
    let (history, _) = trainer.train_and_evaluate(&options)?;

    if args.plot {
        let path = args
            .output_folder
            .join(format!("{model_id}_training_history.png"));
        plot_training_history(&history, &path)?;
    }
    Ok(())
}

fn compare(args: CompareArgs) -> Result<(), Box<dyn Error>> {
    let simulator = simulator_for(&args.model, args.delta_t, args.max_t)?;
    simulator.check_params(&args.theta)?;
    let simulations = simulate_seeded(simulator.as_ref(), &args.theta, args.n_samples, args.seed)?;

    let network_config: NetworkConfig = load_json(&args.network_config)?;
    let infer = LoadMlpInfer::new(&args.state_dict, network_config, args.theta.len() + 2)?;

    let max_rt = simulations
        .responses()
        .map(|(rt, _)| rt)
        .fold(0.0f32, f32::max);
    let max_rt = if max_rt > 0.0 { max_rt } else { args.max_t };
    let n_grid = args.n_grid.max(1);
    let rt_grid: Vec<f32> = (1..=n_grid)
        .map(|i| i as f32 * max_rt / n_grid as f32)
        .collect();
    let curve = infer.likelihood_curve(&args.theta, &rt_grid)?;

    let title = format!("{} theta = {:?}", simulator.name(), args.theta);
    plot_likelihood_comparison(&simulations, &curve, &args.output, &title)?;
    Ok(())
}
