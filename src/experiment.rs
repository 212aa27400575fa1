use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use chrono::Local;

use crate::{
    eval,
    model::{ModelKind, model_name},
    train::{self, TrainingConfig},
};

/// Where an experiment reads datasets and writes its artifacts. The source
/// kept these as module-level globals; here they are explicit.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub archive_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub models_dir: PathBuf,
    pub result_dir: PathBuf,
    pub simplify: bool,
}

impl ExperimentConfig {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            models_dir: PathBuf::from("models"),
            result_dir: PathBuf::from("results"),
            simplify: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub dataset: String,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub training_time: f64,
}

pub const RESULTS_HEADER: &str = "dataset,accuracy,precision,recall,training_time";

pub fn create_results_csv(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create results dir '{}'", parent.display()))?;
    }
    let mut f = fs::File::create(path)
        .with_context(|| format!("cannot create results file '{}'", path.display()))?;
    writeln!(f, "{RESULTS_HEADER}")?;
    Ok(())
}

pub fn add_results(path: &Path, record: &ResultRecord) -> Result<()> {
    let mut f = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("cannot append to results file '{}'", path.display()))?;
    writeln!(
        f,
        "{},{:.6},{:.6},{:.6},{:.2}",
        record.dataset, record.accuracy, record.precision, record.recall, record.training_time
    )?;
    Ok(())
}

/// Dataset directories under the archive root, sorted by name.
pub fn discover_datasets(archive_dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(archive_dir)
        .with_context(|| format!("cannot read archive dir '{}'", archive_dir.display()))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub fn results_file_name(model_name: &str, timestamp: &str) -> String {
    format!("burn_{model_name}_results_{timestamp}.csv")
}

/// Trains and evaluates the chosen architecture on every dataset in the
/// archive, one dataset at a time, appending one results row per dataset.
/// Returns the path of the results file.
pub fn run_experiment<B: AutodiffBackend>(
    kind: ModelKind,
    exp: &ExperimentConfig,
    config: &TrainingConfig,
    device: B::Device,
) -> Result<PathBuf> {
    let datasets = discover_datasets(&exp.archive_dir)?;
    let model_name = model_name(kind, config.positional_encoding);

    let timestamp = Local::now().format("%m_%d_%Y_%H:%M:%S").to_string();
    let result_file = exp
        .result_dir
        .join(results_file_name(&model_name, &timestamp));
    create_results_csv(&result_file)?;
    tracing::info!(results = %result_file.display(), n_datasets = datasets.len(), "starting experiment");

    for dataset_name in &datasets {
        println!("Training: {model_name} {dataset_name}");
        let outcome = train::fit::<B>(kind, dataset_name, exp, config, device.clone())?;
        let report = eval::test_model::<B::InnerBackend>(
            &outcome.model_config,
            &outcome.checkpoint_path,
            &exp.archive_dir,
            dataset_name,
            config.batch_size,
            &device,
        )?;
        tracing::info!(
            dataset = dataset_name.as_str(),
            accuracy = report.accuracy,
            train_time = outcome.train_time_secs,
            "dataset finished"
        );

        add_results(
            &result_file,
            &ResultRecord {
                dataset: dataset_name.clone(),
                accuracy: report.accuracy,
                precision: report.precision,
                recall: report.recall,
                training_time: outcome.train_time_secs,
            },
        )?;
    }

    Ok(result_file)
}
