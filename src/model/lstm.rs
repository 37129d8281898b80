//! Single-layer LSTMs over `[batch, seq, feature]` tensors.
//!
//! Parameter names follow `torch.nn.LSTM` with `batch_first=True`, so
//! PyTorch checkpoints load as-is:
//!
//! ```text
//! weight_ih_l0 (4H, I)   weight_hh_l0 (4H, H)   bias_ih_l0 (4H)   bias_hh_l0 (4H)
//! weight_ih_l0_reverse   ...                                       (backward direction)
//! ```
//!
//! Gate order is input, forget, cell, output.

use candle_core::{IndexOp, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::{Error, Result};

/// One LSTM direction.
#[derive(Debug, Clone)]
pub struct LstmCell {
    weight_ih: Tensor,
    weight_hh: Tensor,
    /// `bias_ih + bias_hh`, shape `[4H]`.
    bias: Tensor,
    input_size: usize,
    hidden_size: usize,
}

impl LstmCell {
    /// Load (or create) the parameters of one direction.
    ///
    /// `suffix` is `""` for the forward direction and `"_reverse"` for the
    /// backward one. Fresh parameters are drawn from `U(-1/√H, 1/√H)`.
    pub fn load(
        vb: &VarBuilder,
        suffix: &str,
        input_size: usize,
        hidden_size: usize,
    ) -> Result<Self> {
        let bound = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let gates = 4 * hidden_size;
        let weight_ih =
            vb.get_with_hints((gates, input_size), &format!("weight_ih_l0{suffix}"), init)?;
        let weight_hh =
            vb.get_with_hints((gates, hidden_size), &format!("weight_hh_l0{suffix}"), init)?;
        let bias_ih = vb.get_with_hints(gates, &format!("bias_ih_l0{suffix}"), init)?;
        let bias_hh = vb.get_with_hints(gates, &format!("bias_hh_l0{suffix}"), init)?;
        let bias = (bias_ih + bias_hh)?;
        Ok(Self {
            weight_ih,
            weight_hh,
            bias,
            input_size,
            hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Run over the whole sequence from zero state.
    ///
    /// - `x`: `[B, S, I]`
    /// - `reverse`: walk the sequence from the last step to the first
    ///
    /// Returns `[B, S, H]` with outputs in sequence order either way.
    pub fn forward(&self, x: &Tensor, reverse: bool) -> Result<Tensor> {
        let (batch, seq_len, features) = x.dims3()?;
        if features != self.input_size {
            return Err(Error::ShapeMismatch(format!(
                "LSTM expects {} input features, got {features}",
                self.input_size
            )));
        }
        let h_size = self.hidden_size;

        // Input projections for every step at once: [B, S, 4H]
        let gates_x = x
            .contiguous()?
            .broadcast_matmul(&self.weight_ih.t()?)?
            .broadcast_add(&self.bias)?;
        let weight_hh_t = self.weight_hh.t()?;

        let mut h = Tensor::zeros((batch, h_size), x.dtype(), x.device())?;
        let mut c = h.clone();
        let mut outputs = Vec::with_capacity(seq_len);

        for step in 0..seq_len {
            let t = if reverse { seq_len - 1 - step } else { step };
            let gates = (gates_x.i((.., t, ..))? + h.matmul(&weight_hh_t)?)?;
            let sig = candle_nn::ops::sigmoid(&gates)?;
            let i = sig.narrow(1, 0, h_size)?;
            let f = sig.narrow(1, h_size, h_size)?;
            let g = gates.narrow(1, 2 * h_size, h_size)?.tanh()?;
            let o = sig.narrow(1, 3 * h_size, h_size)?;

            c = ((f * &c)? + (i * g)?)?;
            h = (o * c.tanh()?)?;
            outputs.push(h.clone());
        }
        if reverse {
            outputs.reverse();
        }

        Ok(Tensor::stack(&outputs, 1)?)
    }
}

/// Unidirectional LSTM: output at step `t` depends only on steps `..=t`.
#[derive(Debug, Clone)]
pub struct Lstm {
    cell: LstmCell,
}

impl Lstm {
    pub fn load(vb: VarBuilder, input_size: usize, hidden_size: usize) -> Result<Self> {
        Ok(Self {
            cell: LstmCell::load(&vb, "", input_size, hidden_size)?,
        })
    }

    /// `[B, S, I]` → `[B, S, H]`.
    #[tracing::instrument(name = "lstm_forward", skip_all)]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.cell.forward(x, false)
    }
}

/// Bidirectional LSTM: forward and backward outputs concatenated per step.
#[derive(Debug, Clone)]
pub struct BiLstm {
    forward_cell: LstmCell,
    backward_cell: LstmCell,
}

impl BiLstm {
    /// `hidden_size` is per direction; the output is `2 × hidden_size` wide.
    pub fn load(vb: VarBuilder, input_size: usize, hidden_size: usize) -> Result<Self> {
        Ok(Self {
            forward_cell: LstmCell::load(&vb, "", input_size, hidden_size)?,
            backward_cell: LstmCell::load(&vb, "_reverse", input_size, hidden_size)?,
        })
    }

    /// Output feature width.
    pub fn output_size(&self) -> usize {
        2 * self.forward_cell.hidden_size()
    }

    /// `[B, S, I]` → `[B, S, 2H]`.
    #[tracing::instrument(name = "bilstm_forward", skip_all)]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let fwd = self.forward_cell.forward(x, false)?;
        let bwd = self.backward_cell.forward(x, true)?;
        Ok(Tensor::cat(&[&fwd, &bwd], 2)?)
    }
}
