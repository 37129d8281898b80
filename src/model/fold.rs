//! Axis folding between the block layout and LSTM sequence layouts.
//!
//! Fusion blocks carry `[B, T, F, C]` tensors. The LSTMs take
//! `[batch, seq, feature]`, so one spatial axis is folded into the batch:
//!
//! ```text
//! fold_time:  [B, T, F, C] → [B·T, F, C]   (sequence = frequency)
//! fold_freq:  [B, T, F, C] → [B·F, T, C]   (sequence = time)
//! ```
//!
//! Each fold has an unfold taking the same factorization back.

use candle_core::Tensor;

use crate::{Error, Result};

/// `[B, T, F, C]` → `[B·T, F, C]`.
pub fn fold_time(x: &Tensor) -> Result<Tensor> {
    let (b, t, f, c) = dims4(x, "fold_time")?;
    Ok(x.reshape((b * t, f, c))?)
}

/// `[B·T, F, C]` → `[B, T, F, C]`.
pub fn unfold_time(x: &Tensor, batch: usize, frames: usize) -> Result<Tensor> {
    let (bt, f, c) = dims3(x, "unfold_time")?;
    if bt != batch * frames {
        return Err(Error::ShapeMismatch(format!(
            "unfold_time: leading axis {bt} is not batch {batch} × frames {frames}"
        )));
    }
    Ok(x.reshape((batch, frames, f, c))?)
}

/// `[B, T, F, C]` → `[B·F, T, C]`.
pub fn fold_freq(x: &Tensor) -> Result<Tensor> {
    let (b, t, f, c) = dims4(x, "fold_freq")?;
    Ok(x.permute((0, 2, 1, 3))?.reshape((b * f, t, c))?)
}

/// `[B·F, T, C]` → `[B, T, F, C]`.
pub fn unfold_freq(x: &Tensor, batch: usize, freqs: usize) -> Result<Tensor> {
    let (bf, t, c) = dims3(x, "unfold_freq")?;
    if bf != batch * freqs {
        return Err(Error::ShapeMismatch(format!(
            "unfold_freq: leading axis {bf} is not batch {batch} × freqs {freqs}"
        )));
    }
    Ok(x.reshape((batch, freqs, t, c))?.permute((0, 2, 1, 3))?)
}

/// Fail with [`Error::ShapeMismatch`] unless `x` has exactly `expected` dims.
pub fn expect_dims(x: &Tensor, expected: &[usize], what: &str) -> Result<()> {
    if x.dims() != expected {
        return Err(Error::ShapeMismatch(format!(
            "{what}: expected {expected:?}, got {:?}",
            x.dims()
        )));
    }
    Ok(())
}

fn dims4(x: &Tensor, what: &str) -> Result<(usize, usize, usize, usize)> {
    match *x.dims() {
        [a, b, c, d] => Ok((a, b, c, d)),
        ref other => Err(Error::ShapeMismatch(format!(
            "{what}: expected a rank-4 tensor, got {other:?}"
        ))),
    }
}

fn dims3(x: &Tensor, what: &str) -> Result<(usize, usize, usize)> {
    match *x.dims() {
        [a, b, c] => Ok((a, b, c)),
        ref other => Err(Error::ShapeMismatch(format!(
            "{what}: expected a rank-3 tensor, got {other:?}"
        ))),
    }
}
