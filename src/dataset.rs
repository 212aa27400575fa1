use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};

/// Metadata the training loop and exporter derive from a dataset.
#[derive(Debug, Clone, Copy)]
pub struct DatasetInfo {
    pub seq_len: usize,
    pub input_dim: usize,
    pub n_classes: usize,
}

#[derive(Debug, Clone)]
pub struct SeriesItem {
    pub values: Vec<f32>,
    pub label: usize,
}

/// One split of a UCR-style dataset, labels already remapped to `0..n_classes`.
pub struct UcrDataset {
    items: Vec<SeriesItem>,
}

impl UcrDataset {
    pub fn new(items: Vec<SeriesItem>) -> Self {
        Self { items }
    }
}

impl Dataset<SeriesItem> for UcrDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, index: usize) -> Option<SeriesItem> {
        self.items.get(index).cloned()
    }
}

#[derive(Clone, Default)]
pub struct SeriesBatcher {}

#[derive(Clone, Debug)]
pub struct SeriesBatch<B: Backend> {
    /// `[batch, seq_len, features]`
    pub series: Tensor<B, 3>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, SeriesItem, SeriesBatch<B>> for SeriesBatcher {
    fn batch(&self, items: Vec<SeriesItem>, device: &B::Device) -> SeriesBatch<B> {
        let series = items
            .iter()
            .map(|item| {
                let seq_len = item.values.len();
                Tensor::<B, 1>::from_floats(item.values.as_slice(), device)
                    .reshape([1, seq_len, 1])
            })
            .collect::<Vec<_>>();
        let targets = items
            .iter()
            .map(|item| item.label as i32)
            .collect::<Vec<_>>();

        SeriesBatch {
            series: Tensor::cat(series, 0),
            targets: Tensor::from_ints(targets.as_slice(), device),
        }
    }
}

/// Loads `<archive>/<name>/<name>_TRAIN.tsv` and `<name>_TEST.tsv`.
///
/// The first field of each row is the class label; labels are remapped to
/// contiguous indices over the union of both splits, sorted.
pub fn load_dataset(
    archive_dir: &Path,
    name: &str,
) -> Result<(UcrDataset, UcrDataset, DatasetInfo)> {
    let dir = archive_dir.join(name);
    let train_raw = read_split(&dir.join(format!("{name}_TRAIN.tsv")))?;
    let test_raw = read_split(&dir.join(format!("{name}_TEST.tsv")))?;

    let mut labels: Vec<i64> = train_raw
        .iter()
        .chain(test_raw.iter())
        .map(|(label, _)| *label)
        .collect();
    labels.sort_unstable();
    labels.dedup();

    let seq_len = train_raw[0].1.len();
    let info = DatasetInfo {
        seq_len,
        input_dim: 1,
        n_classes: labels.len(),
    };

    let train = remap(train_raw, &labels, seq_len, name)?;
    let test = remap(test_raw, &labels, seq_len, name)?;
    Ok((train, test, info))
}

fn remap(
    raw: Vec<(i64, Vec<f32>)>,
    labels: &[i64],
    seq_len: usize,
    name: &str,
) -> Result<UcrDataset> {
    let items = raw
        .into_iter()
        .map(|(label, values)| {
            if values.len() != seq_len {
                bail!(
                    "ragged row in dataset '{name}': expected {seq_len} values, got {}",
                    values.len()
                );
            }
            // The union of both splits was scanned, so the label is present.
            let label = labels.binary_search(&label).unwrap_or_default();
            Ok(SeriesItem { values, label })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(UcrDataset::new(items))
}

fn read_split(path: &Path) -> Result<Vec<(i64, Vec<f32>)>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read dataset file '{}'", path.display()))?;

    let mut rows = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let mut fields = line.split([',', '\t', ' ']).filter(|f| !f.is_empty());
        let Some(label_field) = fields.next() else {
            continue;
        };
        let label = label_field
            .parse::<f64>()
            .with_context(|| {
                format!("bad label {label_field:?} at {}:{}", path.display(), line_no + 1)
            })?
            .round() as i64;
        let values = fields
            .map(|f| f.parse::<f32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("bad value at {}:{}", path.display(), line_no + 1))?;
        rows.push((label, values));
    }

    if rows.is_empty() {
        bail!("dataset file '{}' is empty", path.display());
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backend as TestBackend;
    use std::path::PathBuf;

    fn write_archive(tag: &str, train: &str, test: &str) -> PathBuf {
        let archive = std::env::temp_dir()
            .join(format!("tsc-bench-dataset-{}-{tag}", std::process::id()));
        let dir = archive.join("Toy");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Toy_TRAIN.tsv"), train).unwrap();
        fs::write(dir.join("Toy_TEST.tsv"), test).unwrap();
        archive
    }

    #[test]
    fn loads_and_remaps_labels() {
        let archive = write_archive(
            "remap",
            "-1\t0.1\t0.2\t0.3\n1\t0.4\t0.5\t0.6\n",
            "1\t0.0\t0.1\t0.2\n",
        );
        let (train, test, info) = load_dataset(&archive, "Toy").unwrap();

        assert_eq!(info.seq_len, 3);
        assert_eq!(info.input_dim, 1);
        assert_eq!(info.n_classes, 2);
        assert_eq!(train.len(), 2);
        assert_eq!(test.len(), 1);
        assert_eq!(train.get(0).unwrap().label, 0);
        assert_eq!(train.get(1).unwrap().label, 1);
        assert_eq!(test.get(0).unwrap().label, 1);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let archive = write_archive(
            "ragged",
            "1\t0.1\t0.2\t0.3\n2\t0.4\t0.5\n",
            "1\t0.0\t0.1\t0.2\n",
        );
        assert!(load_dataset(&archive, "Toy").is_err());
    }

    #[test]
    fn batcher_stacks_items() {
        let items = vec![
            SeriesItem {
                values: vec![0.0, 1.0, 2.0],
                label: 0,
            },
            SeriesItem {
                values: vec![3.0, 4.0, 5.0],
                label: 1,
            },
        ];

        let batch: SeriesBatch<TestBackend> =
            SeriesBatcher::default().batch(items, &Default::default());
        assert_eq!(batch.series.dims(), [2, 3, 1]);
        assert_eq!(batch.targets.dims(), [2]);
    }
}
