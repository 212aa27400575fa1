use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::module::Module;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::Backend;

use crate::dataset::{self, SeriesBatch, SeriesBatcher};
use crate::model::{Classifier, ClassifierConfig};

#[derive(Debug, Clone, Copy)]
pub struct EvalReport {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
}

/// Running confusion tallies over a test set.
#[derive(Debug, Clone)]
pub struct Confusion {
    correct: usize,
    total: usize,
    true_pos: Vec<usize>,
    false_pos: Vec<usize>,
    false_neg: Vec<usize>,
}

impl Confusion {
    pub fn new(n_classes: usize) -> Self {
        Self {
            correct: 0,
            total: 0,
            true_pos: vec![0; n_classes],
            false_pos: vec![0; n_classes],
            false_neg: vec![0; n_classes],
        }
    }

    pub fn record(&mut self, pred: usize, target: usize) {
        self.total += 1;
        if pred == target {
            self.correct += 1;
            self.true_pos[target] += 1;
        } else {
            self.false_pos[pred] += 1;
            self.false_neg[target] += 1;
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    /// Macro-averaged over all classes; classes never predicted score 0.
    pub fn macro_precision(&self) -> f64 {
        self.macro_avg(&self.false_pos)
    }

    pub fn macro_recall(&self) -> f64 {
        self.macro_avg(&self.false_neg)
    }

    fn macro_avg(&self, errors: &[usize]) -> f64 {
        if self.true_pos.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .true_pos
            .iter()
            .zip(errors)
            .map(|(&tp, &err)| {
                let denom = tp + err;
                if denom == 0 { 0.0 } else { tp as f64 / denom as f64 }
            })
            .sum();
        sum / self.true_pos.len() as f64
    }

    pub fn report(&self) -> EvalReport {
        EvalReport {
            accuracy: self.accuracy(),
            precision: self.macro_precision(),
            recall: self.macro_recall(),
        }
    }
}

/// Scores a model over a test loader. Runs on a non-autodiff backend, so no
/// gradients are tracked.
pub fn evaluate<B: Backend>(
    model: &Classifier<B>,
    loader: &Arc<dyn DataLoader<B, SeriesBatch<B>>>,
    n_classes: usize,
) -> EvalReport {
    let mut confusion = Confusion::new(n_classes);

    for batch in loader.iter() {
        let probs = model.forward(batch.series);
        let preds = probs.argmax(1).flatten::<1>(0, 1).into_data();
        let targets = batch.targets.into_data();

        for (pred, target) in preds.iter::<i64>().zip(targets.iter::<i64>()) {
            confusion.record(pred as usize, target as usize);
        }
    }

    confusion.report()
}

/// Rebuilds the architecture from its config, loads the checkpoint and scores
/// the dataset's test split.
pub fn test_model<B: Backend>(
    model_config: &ClassifierConfig,
    checkpoint: &Path,
    archive_dir: &Path,
    dataset_name: &str,
    batch_size: usize,
    device: &B::Device,
) -> Result<EvalReport> {
    let (_, test, info) = dataset::load_dataset(archive_dir, dataset_name)?;

    let record = CompactRecorder::new()
        .load(checkpoint.to_path_buf(), device)
        .with_context(|| format!("cannot load checkpoint '{}'", checkpoint.display()))?;
    let model = model_config.init::<B>(device).load_record(record);

    let loader = DataLoaderBuilder::new(SeriesBatcher::default())
        .batch_size(batch_size)
        .build(test);

    Ok(evaluate(&model, &loader, info.n_classes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_is_correct_over_total() {
        let mut confusion = Confusion::new(2);
        let preds = [0, 0, 0, 1, 1, 1, 1, 1, 0, 1];
        let targets = [0, 0, 0, 1, 1, 1, 1, 0, 1, 0];
        for (p, t) in preds.iter().zip(targets.iter()) {
            confusion.record(*p, *t);
        }
        assert_eq!(confusion.accuracy(), 0.7);
    }

    #[test]
    fn perfect_predictions_score_one() {
        let mut confusion = Confusion::new(3);
        for class in 0..3 {
            confusion.record(class, class);
        }
        let report = confusion.report();
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.precision, 1.0);
        assert_eq!(report.recall, 1.0);
    }

    #[test]
    fn empty_tally_reports_zero() {
        let report = Confusion::new(2).report();
        assert_eq!(report.accuracy, 0.0);
        assert_eq!(report.precision, 0.0);
        assert_eq!(report.recall, 0.0);
    }

    #[test]
    fn macro_average_splits_per_class() {
        let mut confusion = Confusion::new(2);
        // Class 0: tp=1 fp=1 -> precision 0.5; class 1: tp=1 fp=1 -> 0.5.
        confusion.record(0, 0);
        confusion.record(0, 1);
        confusion.record(1, 1);
        confusion.record(1, 0);
        let report = confusion.report();
        assert_eq!(report.accuracy, 0.5);
        assert_eq!(report.precision, 0.5);
        assert_eq!(report.recall, 0.5);
    }
}
