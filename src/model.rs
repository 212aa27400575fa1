use std::str::FromStr;

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::pool::{AdaptiveAvgPool1d, AdaptiveAvgPool1dConfig};
use burn::nn::{
    BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, Linear, LinearConfig, Lstm,
    LstmConfig, PaddingConfig1d,
};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::{Tensor, backend::Backend};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::focused::{FocusedLstm, FocusedLstmConfig};

/// Convolution block sizes of the FCN branch, taken from the LSTM-FCN paper.
pub const FCN_FILTERS: [usize; 3] = [128, 256, 128];
pub const FCN_KERNELS: [usize; 3] = [8, 5, 3];

/// Architectures known to the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    LstmFcn,
    VanillaLstm,
    FocusedLstm,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::LstmFcn,
        ModelKind::VanillaLstm,
        ModelKind::FocusedLstm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::LstmFcn => "lstm_fcn",
            ModelKind::VanillaLstm => "vanilla_lstm",
            ModelKind::FocusedLstm => "focused_lstm",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown model id: {0:?}")]
pub struct UnknownModel(pub String);

impl FromStr for ModelKind {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownModel(s.to_string()))
    }
}

/// Model identity used for checkpoint, export and results-file names.
pub fn model_name(kind: ModelKind, positional_encoding: bool) -> String {
    if positional_encoding {
        format!("{}_posenc", kind.name())
    } else {
        kind.name().to_string()
    }
}

/// Fixed sinusoidal encoding added to the raw input sequence.
#[derive(Module, Debug)]
pub struct PositionalEncoding<B: Backend> {
    pub encoding: Tensor<B, 3>,
}

impl<B: Backend> PositionalEncoding<B> {
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        input.add(self.encoding.clone())
    }
}

#[derive(Config, Debug)]
pub struct PositionalEncodingConfig {
    pub seq_len: usize,
    pub d_model: usize,
}

impl PositionalEncodingConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PositionalEncoding<B> {
        let mut table = vec![0.0f32; self.seq_len * self.d_model];
        for pos in 0..self.seq_len {
            for i in 0..self.d_model {
                let exponent = 2.0 * (i / 2) as f64 / self.d_model as f64;
                let angle = pos as f64 / 10_000f64.powf(exponent);
                let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
                table[pos * self.d_model + i] = value as f32;
            }
        }
        PositionalEncoding {
            encoding: Tensor::<B, 1>::from_floats(table.as_slice(), device).reshape([
                1,
                self.seq_len,
                self.d_model,
            ]),
        }
    }
}

/// Stack of `n_layers` LSTMs with a dense classification head. All but the
/// last layer feed their full output sequence forward; the last contributes
/// its final hidden state.
#[derive(Module, Debug)]
pub struct VanillaLstmModel<B: Backend> {
    pub pos_enc: Option<PositionalEncoding<B>>,
    pub layers: Vec<Lstm<B>>,
    pub head: Linear<B>,
}

impl<B: Backend> VanillaLstmModel<B> {
    pub fn forward_logits(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let mut x = match &self.pos_enc {
            Some(pe) => pe.forward(input),
            None => input,
        };
        let last = self.layers.len() - 1;
        for layer in &self.layers[..last] {
            x = layer.forward(x, None).0;
        }
        let (_, state) = self.layers[last].forward(x, None);
        self.head.forward(state.hidden)
    }
}

/// Same stacking as the vanilla model, over the focused cell variant.
#[derive(Module, Debug)]
pub struct FocusedLstmModel<B: Backend> {
    pub pos_enc: Option<PositionalEncoding<B>>,
    pub layers: Vec<FocusedLstm<B>>,
    pub head: Linear<B>,
}

impl<B: Backend> FocusedLstmModel<B> {
    pub fn forward_logits(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let mut x = match &self.pos_enc {
            Some(pe) => pe.forward(input),
            None => input,
        };
        let last = self.layers.len() - 1;
        for layer in &self.layers[..last] {
            x = layer.forward(x, None).0;
        }
        let (_, state) = self.layers[last].forward(x, None);
        self.head.forward(state.hidden)
    }
}

/// LSTM-FCN hybrid: a recurrent branch and a three-block convolutional branch
/// over the same input, concatenated into the classification head.
#[derive(Module, Debug)]
pub struct LstmFcnModel<B: Backend> {
    pub pos_enc: Option<PositionalEncoding<B>>,
    pub lstm: Lstm<B>,
    pub dropout: Dropout,
    pub conv1: Conv1d<B>,
    pub bn1: BatchNorm<B, 1>,
    pub conv2: Conv1d<B>,
    pub bn2: BatchNorm<B, 1>,
    pub conv3: Conv1d<B>,
    pub bn3: BatchNorm<B, 1>,
    pub gap: AdaptiveAvgPool1d,
    pub head: Linear<B>,
}

impl<B: Backend> LstmFcnModel<B> {
    pub fn forward_logits(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let x = match &self.pos_enc {
            Some(pe) => pe.forward(input),
            None => input,
        };

        let (_, state) = self.lstm.forward(x.clone(), None);
        let rec = self.dropout.forward(state.hidden);

        // Conv1d expects channels first.
        let y = x.swap_dims(1, 2);
        let y = relu(self.bn1.forward(self.conv1.forward(y)));
        let y = relu(self.bn2.forward(self.conv2.forward(y)));
        let y = relu(self.bn3.forward(self.conv3.forward(y)));
        let y = self.gap.forward(y).squeeze::<2>(2);

        self.head.forward(Tensor::cat(vec![rec, y], 1))
    }
}

/// A trained (or trainable) classifier, dispatched by [`ModelKind`].
#[derive(Module, Debug)]
pub enum Classifier<B: Backend> {
    VanillaLstm(VanillaLstmModel<B>),
    FocusedLstm(FocusedLstmModel<B>),
    LstmFcn(LstmFcnModel<B>),
}

impl<B: Backend> Classifier<B> {
    pub fn kind(&self) -> ModelKind {
        match self {
            Classifier::VanillaLstm(_) => ModelKind::VanillaLstm,
            Classifier::FocusedLstm(_) => ModelKind::FocusedLstm,
            Classifier::LstmFcn(_) => ModelKind::LstmFcn,
        }
    }

    /// Raw class scores, fed to the cross-entropy loss during training.
    pub fn forward_logits(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        match self {
            Classifier::VanillaLstm(m) => m.forward_logits(input),
            Classifier::FocusedLstm(m) => m.forward_logits(input),
            Classifier::LstmFcn(m) => m.forward_logits(input),
        }
    }

    /// Class probabilities, normalized per example.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        softmax(self.forward_logits(input), 1)
    }
}

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub kind: ModelKind,
    pub input_dim: usize,
    pub seq_len: usize,
    pub hidden_size: usize,
    pub n_classes: usize,
    #[config(default = 1)]
    pub n_layers: usize,
    #[config(default = false)]
    pub positional_encoding: bool,
}

impl ClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        let pos_enc = self
            .positional_encoding
            .then(|| PositionalEncodingConfig::new(self.seq_len, self.input_dim).init(device));

        match self.kind {
            ModelKind::VanillaLstm => Classifier::VanillaLstm(VanillaLstmModel {
                pos_enc,
                layers: (0..self.n_layers)
                    .map(|i| {
                        let d_in = if i == 0 { self.input_dim } else { self.hidden_size };
                        LstmConfig::new(d_in, self.hidden_size, true).init(device)
                    })
                    .collect(),
                head: LinearConfig::new(self.hidden_size, self.n_classes).init(device),
            }),
            ModelKind::FocusedLstm => Classifier::FocusedLstm(FocusedLstmModel {
                pos_enc,
                layers: (0..self.n_layers)
                    .map(|i| {
                        let d_in = if i == 0 { self.input_dim } else { self.hidden_size };
                        FocusedLstmConfig::new(d_in, self.hidden_size).init(device)
                    })
                    .collect(),
                head: LinearConfig::new(self.hidden_size, self.n_classes).init(device),
            }),
            ModelKind::LstmFcn => {
                let conv = |d_in: usize, d_out: usize, kernel: usize| {
                    Conv1dConfig::new(d_in, d_out, kernel)
                        .with_padding(PaddingConfig1d::Same)
                        .with_initializer(Initializer::KaimingUniform {
                            gain: 1.0,
                            fan_out_only: false,
                        })
                        .init(device)
                };
                Classifier::LstmFcn(LstmFcnModel {
                    pos_enc,
                    lstm: LstmConfig::new(self.input_dim, self.hidden_size, true).init(device),
                    dropout: DropoutConfig::new(0.8).init(),
                    conv1: conv(self.input_dim, FCN_FILTERS[0], FCN_KERNELS[0]),
                    bn1: BatchNormConfig::new(FCN_FILTERS[0]).init(device),
                    conv2: conv(FCN_FILTERS[0], FCN_FILTERS[1], FCN_KERNELS[1]),
                    bn2: BatchNormConfig::new(FCN_FILTERS[1]).init(device),
                    conv3: conv(FCN_FILTERS[1], FCN_FILTERS[2], FCN_KERNELS[2]),
                    bn3: BatchNormConfig::new(FCN_FILTERS[2]).init(device),
                    gap: AdaptiveAvgPool1dConfig::new(1).init(),
                    head: LinearConfig::new(self.hidden_size + FCN_FILTERS[2], self.n_classes)
                        .init(device),
                })
            }
        }
    }
}
