use std::fs;
use std::path::{Path, PathBuf};

use tsc_bench_burn::{
    TrainBackend, export,
    experiment::{ExperimentConfig, run_experiment},
    model::ModelKind,
    train::TrainingConfig,
};

fn write_toy_archive(archive: &Path) {
    let dir = archive.join("Toy");
    fs::create_dir_all(&dir).unwrap();
    let rows = "0\t0.0\t0.1\t0.2\t0.3\t0.4\n\
                1\t1.0\t0.9\t0.8\t0.7\t0.6\n\
                0\t0.1\t0.1\t0.2\t0.2\t0.3\n\
                1\t0.9\t0.9\t0.8\t0.8\t0.7\n";
    fs::write(dir.join("Toy_TRAIN.tsv"), rows).unwrap();
    fs::write(dir.join("Toy_TEST.tsv"), rows).unwrap();
}

fn workspace(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("tsc-bench-e2e-{}-{tag}", std::process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    root
}

#[test]
fn one_epoch_produces_checkpoint_and_results_row() {
    let root = workspace("vanilla");
    let archive = root.join("archive");
    write_toy_archive(&archive);

    let mut exp = ExperimentConfig::new(&archive);
    exp.checkpoint_dir = root.join("checkpoints");
    exp.models_dir = root.join("models");
    exp.result_dir = root.join("results");
    exp.simplify = true;

    let config = TrainingConfig::new()
        .with_hidden_size(4)
        .with_n_epochs(1)
        .with_batch_size(2);

    let result_file = run_experiment::<TrainBackend>(
        ModelKind::VanillaLstm,
        &exp,
        &config,
        Default::default(),
    )
    .unwrap();

    // Exactly one checkpoint file, keyed by model name.
    let checkpoints: Vec<_> = fs::read_dir(root.join("checkpoints"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(checkpoints.len(), 1);
    assert!(checkpoints[0].starts_with("vanilla_lstm"));

    // One results row, accuracy within [0, 1].
    let text = fs::read_to_string(&result_file).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "dataset,accuracy,precision,recall,training_time");
    let fields: Vec<&str> = lines[1].split(',').collect();
    assert_eq!(fields[0], "Toy");
    let accuracy: f64 = fields[1].parse().unwrap();
    assert!((0.0..=1.0).contains(&accuracy), "accuracy {accuracy}");

    // The interchange file was exported and its LSTM state outputs stripped.
    let graph = export::read_graph(&root.join("models").join("vanilla_lstm_Toy.safetensors")).unwrap();
    assert!(
        graph
            .nodes
            .iter()
            .filter(|n| n.op_type == "Lstm")
            .all(|n| n.outputs.len() == 1)
    );
}

#[test]
fn hybrid_model_trains_end_to_end() {
    let root = workspace("fcn");
    let archive = root.join("archive");
    write_toy_archive(&archive);

    let mut exp = ExperimentConfig::new(&archive);
    exp.checkpoint_dir = root.join("checkpoints");
    exp.models_dir = root.join("models");
    exp.result_dir = root.join("results");
    exp.simplify = false;

    let config = TrainingConfig::new()
        .with_hidden_size(4)
        .with_n_epochs(1)
        .with_batch_size(4);

    let result_file =
        run_experiment::<TrainBackend>(ModelKind::LstmFcn, &exp, &config, Default::default())
            .unwrap();

    assert_eq!(fs::read_to_string(&result_file).unwrap().lines().count(), 2);
    assert!(root.join("models").join("lstm_fcn_Toy.safetensors").exists());
}
