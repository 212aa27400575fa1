use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::sigmoid;
use burn::tensor::{Tensor, backend::Backend};

/// Focused LSTM layer.
///
/// The input, forget and output gates see only the previous hidden state,
/// while the cell candidate sees only the current input.
#[derive(Module, Debug)]
pub struct FocusedLstm<B: Backend> {
    pub input_gate: Linear<B>,
    pub forget_gate: Linear<B>,
    pub output_gate: Linear<B>,
    pub cell_transform: Linear<B>,
    pub d_hidden: usize,
}

#[derive(Clone, Debug)]
pub struct FocusedLstmState<B: Backend> {
    pub cell: Tensor<B, 2>,
    pub hidden: Tensor<B, 2>,
}

impl<B: Backend> FocusedLstmState<B> {
    pub fn new(cell: Tensor<B, 2>, hidden: Tensor<B, 2>) -> Self {
        Self { cell, hidden }
    }
}

impl<B: Backend> FocusedLstm<B> {
    /// Runs the layer over a `[batch, seq_len, d_input]` input and returns the
    /// hidden states of every step `[batch, seq_len, d_hidden]` together with
    /// the final state.
    pub fn forward(
        &self,
        batched_input: Tensor<B, 3>,
        state: Option<FocusedLstmState<B>>,
    ) -> (Tensor<B, 3>, FocusedLstmState<B>) {
        let device = batched_input.device();
        let [batch_size, seq_len, _d_input] = batched_input.dims();

        let FocusedLstmState {
            mut cell,
            mut hidden,
        } = state.unwrap_or_else(|| {
            FocusedLstmState::new(
                Tensor::zeros([batch_size, self.d_hidden], &device),
                Tensor::zeros([batch_size, self.d_hidden], &device),
            )
        });

        let mut hidden_states = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let x_t = batched_input
                .clone()
                .slice([0..batch_size, t..t + 1])
                .squeeze::<2>(1);

            let i = sigmoid(self.input_gate.forward(hidden.clone()));
            let f = sigmoid(self.forget_gate.forward(hidden.clone()));
            let o = sigmoid(self.output_gate.forward(hidden));
            let z = self.cell_transform.forward(x_t).tanh();

            cell = f.mul(cell).add(i.mul(z));
            hidden = o.mul(cell.clone().tanh());
            hidden_states.push(hidden.clone());
        }

        let output = Tensor::stack(hidden_states, 1);
        (output, FocusedLstmState::new(cell, hidden))
    }
}

#[derive(Config, Debug)]
pub struct FocusedLstmConfig {
    pub d_input: usize,
    pub d_hidden: usize,
    #[config(default = true)]
    pub bias: bool,
}

impl FocusedLstmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FocusedLstm<B> {
        let gate = |d_in: usize| {
            LinearConfig::new(d_in, self.d_hidden)
                .with_bias(self.bias)
                .init(device)
        };
        FocusedLstm {
            input_gate: gate(self.d_hidden),
            forget_gate: gate(self.d_hidden),
            output_gate: gate(self.d_hidden),
            cell_transform: gate(self.d_input),
            d_hidden: self.d_hidden,
        }
    }
}
