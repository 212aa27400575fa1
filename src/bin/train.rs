use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tsc_bench_burn::{
    TrainBackend,
    experiment::{ExperimentConfig, run_experiment},
    model::ModelKind,
    train::TrainingConfig,
};

/// Trains a time-series classifier on every dataset in the archive and
/// records benchmark results.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Model id: lstm_fcn, vanilla_lstm or focused_lstm.
    #[arg(long)]
    model: String,

    /// Archive root holding one directory per dataset.
    #[arg(long, default_value = "data/UCRArchive_2018")]
    archive_dir: PathBuf,

    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    #[arg(long, default_value = "results")]
    result_dir: PathBuf,

    #[arg(long, default_value_t = 128)]
    hidden_size: usize,

    #[arg(long, default_value_t = 1)]
    n_layers: usize,

    #[arg(long, default_value_t = 2000)]
    n_epochs: usize,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    #[arg(long, default_value_t = 1.0e-3)]
    learning_rate: f64,

    /// Inject a positional encoding ahead of the network.
    #[arg(long)]
    positional_encoding: bool,

    /// Strip recurrent state outputs from the exported vanilla graph.
    #[arg(long)]
    simplify: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let kind: ModelKind = args.model.parse()?;

    let mut exp = ExperimentConfig::new(args.archive_dir);
    exp.checkpoint_dir = args.checkpoint_dir;
    exp.models_dir = args.models_dir;
    exp.result_dir = args.result_dir;
    exp.simplify = args.simplify;

    let config = TrainingConfig::new()
        .with_hidden_size(args.hidden_size)
        .with_n_layers(args.n_layers)
        .with_n_epochs(args.n_epochs)
        .with_batch_size(args.batch_size)
        .with_learning_rate(args.learning_rate)
        .with_positional_encoding(args.positional_encoding);

    let device = Default::default();
    let result_file = run_experiment::<TrainBackend>(kind, &exp, &config, device)?;
    println!("Results written to {}", result_file.display());
    Ok(())
}
