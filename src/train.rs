use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use burn::{
    config::Config,
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{CompactRecorder, Recorder},
    tensor::{ElementConversion, backend::AutodiffBackend},
};

use crate::{
    dataset::{self, SeriesBatch, SeriesBatcher},
    eval, export,
    experiment::ExperimentConfig,
    model::{ClassifierConfig, ModelKind, model_name},
    scheduler::ReduceOnPlateauConfig,
};

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = 128)]
    pub hidden_size: usize,
    #[config(default = 1)]
    pub n_layers: usize,
    #[config(default = 2000)]
    pub n_epochs: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = false)]
    pub positional_encoding: bool,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
}

/// Saves only on strict improvement of validation accuracy; ties never save.
pub struct CheckpointPolicy {
    best: f64,
}

impl CheckpointPolicy {
    pub fn new() -> Self {
        Self {
            best: f64::NEG_INFINITY,
        }
    }

    pub fn should_save(&mut self, val_acc: f64) -> bool {
        if val_acc > self.best {
            self.best = val_acc;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TrainOutcome {
    pub model_config: ClassifierConfig,
    pub checkpoint_path: PathBuf,
    pub best_val_acc: f64,
    pub train_time_secs: f64,
}

/// Trains one model on one dataset: mini-batch Adam steps, plateau-scheduled
/// learning rate, best-accuracy checkpointing, and a terminal export of the
/// best checkpoint to the interchange file.
pub fn fit<B: AutodiffBackend>(
    kind: ModelKind,
    dataset_name: &str,
    exp: &ExperimentConfig,
    config: &TrainingConfig,
    device: B::Device,
) -> Result<TrainOutcome> {
    let model_name = model_name(kind, config.positional_encoding);
    let (train_set, test_set, info) = dataset::load_dataset(&exp.archive_dir, dataset_name)?;

    B::seed(config.seed);

    let model_config = ClassifierConfig::new(
        kind,
        info.input_dim,
        info.seq_len,
        config.hidden_size,
        info.n_classes,
    )
    .with_n_layers(config.n_layers)
    .with_positional_encoding(config.positional_encoding);
    let mut model = model_config.init::<B>(&device);

    let batcher = SeriesBatcher::default();
    let dataloader_train = DataLoaderBuilder::new(batcher.clone())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train_set);
    let dataloader_test: Arc<dyn DataLoader<B::InnerBackend, SeriesBatch<B::InnerBackend>>> =
        DataLoaderBuilder::new(batcher)
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .build(test_set);

    let mut optim = AdamConfig::new().init();
    let mut scheduler = ReduceOnPlateauConfig::new(config.learning_rate).init();
    let criterion = CrossEntropyLossConfig::new().init(&device);

    fs::create_dir_all(&exp.checkpoint_dir).with_context(|| {
        format!("cannot create checkpoint dir '{}'", exp.checkpoint_dir.display())
    })?;
    let checkpoint_path = exp.checkpoint_dir.join(&model_name);

    let start = Instant::now();
    let mut policy = CheckpointPolicy::new();
    let mut lr = config.learning_rate;

    for epoch in 0..config.n_epochs {
        let mut last_loss = f64::NAN;
        for batch in dataloader_train.iter() {
            let logits = model.forward_logits(batch.series);
            let loss = criterion.forward(logits, batch.targets);
            last_loss = loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);
        }
        lr = scheduler.step(last_loss);

        let report = eval::evaluate(&model.valid(), &dataloader_test, info.n_classes);

        if epoch % 10 == 0 {
            println!(
                "Epoch: {epoch} train_loss: {last_loss} val_acc: {} lr: {lr}",
                report.accuracy
            );
        }

        if policy.should_save(report.accuracy) {
            CompactRecorder::new()
                .record(model.clone().into_record(), checkpoint_path.clone())
                .with_context(|| {
                    format!("failed to save checkpoint to '{}'", checkpoint_path.display())
                })?;
            tracing::debug!(epoch, val_acc = report.accuracy, "saved checkpoint");
        }
    }
    let train_time_secs = start.elapsed().as_secs_f64();

    // Export the best checkpoint, not the last epoch's weights.
    let record = CompactRecorder::new()
        .load(checkpoint_path.clone(), &device)
        .with_context(|| format!("no checkpoint was saved for '{model_name}'"))?;
    let best = model_config.init::<B>(&device).load_record(record);
    export::export_model(
        &best,
        &model_name,
        dataset_name,
        &info,
        &exp.models_dir,
        exp.simplify,
        &device,
    )?;

    Ok(TrainOutcome {
        model_config,
        checkpoint_path,
        best_val_acc: policy.best(),
        train_time_secs,
    })
}
