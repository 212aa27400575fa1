use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, ensure};
use burn::nn::conv::Conv1d;
use burn::nn::{BatchNorm, Linear, Lstm};
use burn::tensor::{Distribution, Tensor, backend::Backend};
use safetensors::SafeTensors;
use safetensors::tensor::{Dtype, View};
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetInfo;
use crate::focused::FocusedLstm;
use crate::model::{Classifier, ModelKind};

/// Metadata key under which the graph description is stored in the
/// interchange file.
pub const GRAPH_METADATA_KEY: &str = "graph";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub op_type: String,
    /// Upstream tensor names: the activation input first, then weights.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelGraph {
    pub input: String,
    pub output: String,
    /// Dummy-input shape the model was traced with: `(seq_len, 1, input_dim)`.
    pub input_shape: Vec<usize>,
    pub nodes: Vec<GraphNode>,
}

struct WeightTensor {
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl WeightTensor {
    fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values: Vec<f32> = tensor
            .into_data()
            .to_vec()
            .map_err(|err| anyhow!("tensor data conversion failed: {err:?}"))?;
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Ok(Self { shape, data })
    }
}

impl View for WeightTensor {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Serializes a trained model to `<models_dir>/<model_name>_<dataset>.safetensors`:
/// every named weight as a tensor, the traced graph as JSON metadata.
///
/// For the vanilla variant, when `simplify` is set, the file is post-processed
/// in place to drop the recurrent state outputs from the graph.
pub fn export_model<B: Backend>(
    model: &Classifier<B>,
    model_name: &str,
    dataset_name: &str,
    info: &DatasetInfo,
    models_dir: &Path,
    simplify: bool,
    device: &B::Device,
) -> Result<PathBuf> {
    fs::create_dir_all(models_dir)
        .with_context(|| format!("cannot create models dir '{}'", models_dir.display()))?;

    // One forward pass with the dummy input validates the traced wiring.
    let dummy = Tensor::<B, 3>::random(
        [info.seq_len, 1, info.input_dim],
        Distribution::Default,
        device,
    );
    let probs = model.forward(dummy.swap_dims(0, 1));
    ensure!(
        probs.dims() == [1, info.n_classes],
        "trace produced unexpected output shape {:?}",
        probs.dims()
    );

    let (graph, tensors) = trace(model, info)?;
    let mut metadata = HashMap::new();
    metadata.insert(GRAPH_METADATA_KEY.to_string(), serde_json::to_string(&graph)?);

    let bytes = safetensors::serialize(tensors, Some(metadata))
        .map_err(|err| anyhow!("safetensors serialization failed: {err}"))?;
    let path = models_dir.join(format!("{model_name}_{dataset_name}.safetensors"));
    fs::write(&path, bytes)
        .with_context(|| format!("cannot write interchange file '{}'", path.display()))?;

    if simplify && model.kind() == ModelKind::VanillaLstm {
        simplify_model(&path)?;
    }
    Ok(path)
}

/// Deletes the two auxiliary state outputs of every `Lstm` node, keeping only
/// the sequence output, and overwrites the file in place. Returns the number
/// of outputs removed.
pub fn simplify_model(path: &Path) -> Result<usize> {
    let buf =
        fs::read(path).with_context(|| format!("cannot read interchange file '{}'", path.display()))?;
    let mut graph = parse_graph(&buf, path)?;

    let mut removed = 0;
    for node in graph.nodes.iter_mut().filter(|n| n.op_type == "Lstm") {
        removed += node.outputs.len().saturating_sub(1);
        node.outputs.truncate(1);
    }

    let st = SafeTensors::deserialize(&buf)
        .map_err(|err| anyhow!("corrupt interchange file '{}': {err}", path.display()))?;
    let mut metadata = HashMap::new();
    metadata.insert(GRAPH_METADATA_KEY.to_string(), serde_json::to_string(&graph)?);
    let bytes = safetensors::serialize(st.tensors(), Some(metadata))
        .map_err(|err| anyhow!("safetensors serialization failed: {err}"))?;
    fs::write(path, bytes)
        .with_context(|| format!("cannot rewrite interchange file '{}'", path.display()))?;
    Ok(removed)
}

/// Reads back the graph description of an exported interchange file.
pub fn read_graph(path: &Path) -> Result<ModelGraph> {
    let buf =
        fs::read(path).with_context(|| format!("cannot read interchange file '{}'", path.display()))?;
    parse_graph(&buf, path)
}

fn parse_graph(buf: &[u8], path: &Path) -> Result<ModelGraph> {
    let (_, header) = SafeTensors::read_metadata(buf)
        .map_err(|err| anyhow!("corrupt interchange file '{}': {err}", path.display()))?;
    let json = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(GRAPH_METADATA_KEY))
        .with_context(|| format!("interchange file '{}' carries no graph", path.display()))?;
    Ok(serde_json::from_str(json)?)
}

fn trace<B: Backend>(
    model: &Classifier<B>,
    info: &DatasetInfo,
) -> Result<(ModelGraph, Vec<(String, WeightTensor)>)> {
    let mut tensors = Vec::new();
    let mut nodes = Vec::new();
    let mut prev = "input".to_string();

    match model {
        Classifier::VanillaLstm(m) => {
            if m.pos_enc.is_some() {
                prev = push_posenc(&mut nodes, prev);
            }
            for (i, layer) in m.layers.iter().enumerate() {
                prev = push_lstm(&mut nodes, &mut tensors, &format!("lstm{i}"), layer, prev)?;
            }
            prev = push_last_step(&mut nodes, prev);
            push_head(&mut nodes, &mut tensors, &m.head, prev)?;
        }
        Classifier::FocusedLstm(m) => {
            if m.pos_enc.is_some() {
                prev = push_posenc(&mut nodes, prev);
            }
            for (i, layer) in m.layers.iter().enumerate() {
                prev = push_focused(&mut nodes, &mut tensors, &format!("lstm{i}"), layer, prev)?;
            }
            prev = push_last_step(&mut nodes, prev);
            push_head(&mut nodes, &mut tensors, &m.head, prev)?;
        }
        Classifier::LstmFcn(m) => {
            if m.pos_enc.is_some() {
                prev = push_posenc(&mut nodes, prev);
            }

            // Recurrent branch.
            let seq = push_lstm(&mut nodes, &mut tensors, "lstm0", &m.lstm, prev.clone())?;
            let last = push_last_step(&mut nodes, seq);
            nodes.push(GraphNode {
                name: "dropout".to_string(),
                op_type: "Dropout".to_string(),
                inputs: vec![last],
                outputs: vec!["dropout_out".to_string()],
            });

            // Convolutional branch, channels first.
            nodes.push(GraphNode {
                name: "transpose".to_string(),
                op_type: "Transpose".to_string(),
                inputs: vec![prev],
                outputs: vec!["transpose_out".to_string()],
            });
            let mut conv_prev = "transpose_out".to_string();
            let blocks: [(&str, &Conv1d<B>, &BatchNorm<B, 1>); 3] = [
                ("1", &m.conv1, &m.bn1),
                ("2", &m.conv2, &m.bn2),
                ("3", &m.conv3, &m.bn3),
            ];
            for (suffix, conv, bn) in blocks {
                conv_prev = push_conv_block(&mut nodes, &mut tensors, suffix, conv, bn, conv_prev)?;
            }
            nodes.push(GraphNode {
                name: "gap".to_string(),
                op_type: "GlobalAveragePool".to_string(),
                inputs: vec![conv_prev],
                outputs: vec!["gap_out".to_string()],
            });

            nodes.push(GraphNode {
                name: "concat".to_string(),
                op_type: "Concat".to_string(),
                inputs: vec!["dropout_out".to_string(), "gap_out".to_string()],
                outputs: vec!["concat_out".to_string()],
            });
            push_head(&mut nodes, &mut tensors, &m.head, "concat_out".to_string())?;
        }
    }

    let graph = ModelGraph {
        input: "input".to_string(),
        output: "output".to_string(),
        input_shape: vec![info.seq_len, 1, info.input_dim],
        nodes,
    };
    Ok((graph, tensors))
}

fn push_posenc(nodes: &mut Vec<GraphNode>, prev: String) -> String {
    nodes.push(GraphNode {
        name: "posenc".to_string(),
        op_type: "PositionalEncoding".to_string(),
        inputs: vec![prev],
        outputs: vec!["posenc_out".to_string()],
    });
    "posenc_out".to_string()
}

/// The classification head consumes the last step of the recurrent sequence
/// output, so the state outputs stay unreferenced and safe to strip.
fn push_last_step(nodes: &mut Vec<GraphNode>, prev: String) -> String {
    nodes.push(GraphNode {
        name: "last_step".to_string(),
        op_type: "Slice".to_string(),
        inputs: vec![prev],
        outputs: vec!["last_step_out".to_string()],
    });
    "last_step_out".to_string()
}

fn push_lstm<B: Backend>(
    nodes: &mut Vec<GraphNode>,
    tensors: &mut Vec<(String, WeightTensor)>,
    name: &str,
    lstm: &Lstm<B>,
    prev: String,
) -> Result<String> {
    let mut inputs = vec![prev];
    for (gate_name, gate) in [
        ("input_gate", &lstm.input_gate),
        ("forget_gate", &lstm.forget_gate),
        ("cell_gate", &lstm.cell_gate),
        ("output_gate", &lstm.output_gate),
    ] {
        inputs.extend(push_linear(
            tensors,
            &format!("{name}.{gate_name}.input_transform"),
            &gate.input_transform,
        )?);
        inputs.extend(push_linear(
            tensors,
            &format!("{name}.{gate_name}.hidden_transform"),
            &gate.hidden_transform,
        )?);
    }
    nodes.push(GraphNode {
        name: name.to_string(),
        op_type: "Lstm".to_string(),
        inputs,
        outputs: vec![
            format!("{name}_out"),
            format!("{name}_h"),
            format!("{name}_c"),
        ],
    });
    Ok(format!("{name}_out"))
}

fn push_focused<B: Backend>(
    nodes: &mut Vec<GraphNode>,
    tensors: &mut Vec<(String, WeightTensor)>,
    name: &str,
    layer: &FocusedLstm<B>,
    prev: String,
) -> Result<String> {
    let mut inputs = vec![prev];
    for (part, linear) in [
        ("input_gate", &layer.input_gate),
        ("forget_gate", &layer.forget_gate),
        ("output_gate", &layer.output_gate),
        ("cell_transform", &layer.cell_transform),
    ] {
        inputs.extend(push_linear(tensors, &format!("{name}.{part}"), linear)?);
    }
    nodes.push(GraphNode {
        name: name.to_string(),
        op_type: "FocusedLstm".to_string(),
        inputs,
        outputs: vec![
            format!("{name}_out"),
            format!("{name}_h"),
            format!("{name}_c"),
        ],
    });
    Ok(format!("{name}_out"))
}

fn push_conv_block<B: Backend>(
    nodes: &mut Vec<GraphNode>,
    tensors: &mut Vec<(String, WeightTensor)>,
    suffix: &str,
    conv: &Conv1d<B>,
    bn: &BatchNorm<B, 1>,
    prev: String,
) -> Result<String> {
    let conv_name = format!("conv{suffix}");
    let mut inputs = vec![prev];
    inputs.push(push_tensor(tensors, format!("{conv_name}.weight"), conv.weight.val())?);
    if let Some(bias) = &conv.bias {
        inputs.push(push_tensor(tensors, format!("{conv_name}.bias"), bias.val())?);
    }
    nodes.push(GraphNode {
        name: conv_name.clone(),
        op_type: "Conv".to_string(),
        inputs,
        outputs: vec![format!("{conv_name}_out")],
    });

    let bn_name = format!("bn{suffix}");
    let inputs = vec![
        format!("{conv_name}_out"),
        push_tensor(tensors, format!("{bn_name}.gamma"), bn.gamma.val())?,
        push_tensor(tensors, format!("{bn_name}.beta"), bn.beta.val())?,
        push_tensor(tensors, format!("{bn_name}.running_mean"), bn.running_mean.value())?,
        push_tensor(tensors, format!("{bn_name}.running_var"), bn.running_var.value())?,
    ];
    nodes.push(GraphNode {
        name: bn_name.clone(),
        op_type: "BatchNormalization".to_string(),
        inputs,
        outputs: vec![format!("{bn_name}_out")],
    });

    let relu_name = format!("relu{suffix}");
    nodes.push(GraphNode {
        name: relu_name.clone(),
        op_type: "Relu".to_string(),
        inputs: vec![format!("{bn_name}_out")],
        outputs: vec![format!("{relu_name}_out")],
    });
    Ok(format!("{relu_name}_out"))
}

fn push_head<B: Backend>(
    nodes: &mut Vec<GraphNode>,
    tensors: &mut Vec<(String, WeightTensor)>,
    head: &Linear<B>,
    prev: String,
) -> Result<()> {
    let mut inputs = vec![prev];
    inputs.extend(push_linear(tensors, "head", head)?);
    nodes.push(GraphNode {
        name: "head".to_string(),
        op_type: "Linear".to_string(),
        inputs,
        outputs: vec!["head_out".to_string()],
    });
    nodes.push(GraphNode {
        name: "softmax".to_string(),
        op_type: "Softmax".to_string(),
        inputs: vec!["head_out".to_string()],
        outputs: vec!["output".to_string()],
    });
    Ok(())
}

fn push_linear<B: Backend>(
    tensors: &mut Vec<(String, WeightTensor)>,
    prefix: &str,
    linear: &Linear<B>,
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    names.push(push_tensor(tensors, format!("{prefix}.weight"), linear.weight.val())?);
    if let Some(bias) = &linear.bias {
        names.push(push_tensor(tensors, format!("{prefix}.bias"), bias.val())?);
    }
    Ok(names)
}

fn push_tensor<B: Backend, const D: usize>(
    tensors: &mut Vec<(String, WeightTensor)>,
    name: String,
    tensor: Tensor<B, D>,
) -> Result<String> {
    tensors.push((name.clone(), WeightTensor::from_tensor(tensor)?));
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backend as TestBackend;
    use crate::model::ClassifierConfig;
    use std::path::PathBuf;

    fn models_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("tsc-bench-export-{}-{tag}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn toy_info() -> DatasetInfo {
        DatasetInfo {
            seq_len: 5,
            input_dim: 1,
            n_classes: 2,
        }
    }

    fn export(kind: ModelKind, n_layers: usize, simplify: bool, tag: &str) -> PathBuf {
        let device = Default::default();
        let info = toy_info();
        let model = ClassifierConfig::new(kind, info.input_dim, info.seq_len, 4, info.n_classes)
            .with_n_layers(n_layers)
            .init::<TestBackend>(&device);
        export_model(
            &model,
            kind.name(),
            "Toy",
            &info,
            &models_dir(tag),
            simplify,
            &device,
        )
        .unwrap()
    }

    #[test]
    fn graph_names_input_and_output() {
        let path = export(ModelKind::VanillaLstm, 1, false, "naming");
        let graph = read_graph(&path).unwrap();
        assert_eq!(graph.input, "input");
        assert_eq!(graph.output, "output");
        assert_eq!(graph.input_shape, vec![5, 1, 1]);
        assert_eq!(graph.nodes.last().unwrap().outputs, vec!["output"]);
    }

    #[test]
    fn simplify_strips_two_state_outputs_per_lstm_node() {
        let path = export(ModelKind::VanillaLstm, 2, false, "strip");

        let before = read_graph(&path).unwrap();
        let lstm_nodes = |g: &ModelGraph| {
            g.nodes
                .iter()
                .filter(|n| n.op_type == "Lstm")
                .map(|n| n.outputs.len())
                .collect::<Vec<_>>()
        };
        assert_eq!(lstm_nodes(&before), vec![3, 3]);

        let removed = simplify_model(&path).unwrap();
        assert_eq!(removed, 4);

        let after = read_graph(&path).unwrap();
        assert_eq!(lstm_nodes(&after), vec![1, 1]);
        // Everything else survives untouched.
        assert_eq!(before.nodes.len(), after.nodes.len());
    }

    #[test]
    fn vanilla_export_simplifies_when_asked() {
        let path = export(ModelKind::VanillaLstm, 1, true, "auto");
        let graph = read_graph(&path).unwrap();
        let lstm = graph.nodes.iter().find(|n| n.op_type == "Lstm").unwrap();
        assert_eq!(lstm.outputs.len(), 1);
    }

    #[test]
    fn other_variants_are_never_post_processed() {
        for (kind, tag) in [
            (ModelKind::FocusedLstm, "focused"),
            (ModelKind::LstmFcn, "fcn"),
        ] {
            let path = export(kind, 1, true, tag);
            let graph = read_graph(&path).unwrap();
            for node in graph
                .nodes
                .iter()
                .filter(|n| n.op_type == "Lstm" || n.op_type == "FocusedLstm")
            {
                assert_eq!(node.outputs.len(), 3, "{} node was modified", node.name);
            }
        }
    }

    #[test]
    fn fcn_graph_has_both_branches() {
        let path = export(ModelKind::LstmFcn, 1, false, "branches");
        let graph = read_graph(&path).unwrap();
        let ops: Vec<&str> = graph.nodes.iter().map(|n| n.op_type.as_str()).collect();
        for op in ["Lstm", "Dropout", "Conv", "BatchNormalization", "Relu", "GlobalAveragePool", "Concat", "Softmax"] {
            assert!(ops.contains(&op), "missing op {op}");
        }
        assert_eq!(ops.iter().filter(|op| **op == "Conv").count(), 3);
    }
}
