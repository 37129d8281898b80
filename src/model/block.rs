//! Full-band / narrow-band fusion block.
//!
//! ## Data flow
//!
//! ```text
//! x: [B, T, F, C] ─┬─ fold_freq ─────────────────────────────┐ snapshot [B·F, T, C]
//!                  │                                          │
//!                  └─ fold_time → [B·T, F, C] (+ fb_skip)      │
//!                     fullLstm (bidirectional over F)         │
//!                     → [B·T, F, H] ══ fb_skip'               │
//!                     dropout → unfold_time → fold_freq       │
//!                     → [B·F, T, H]  ⊕ snapshot (first block: concat)
//!                                    + nb_skip  (chained block: add)
//!                     narrLstm (over T: bidirectional offline, causal online)
//!                     → [B·F, T, H] ══ nb_skip'
//!                     dropout → unfold_freq → [B, T, F, H]
//! ```
//!
//! The full-band LSTM sees one frame at a time, so only the narrow-band
//! LSTM decides whether the block looks at future frames.
//!
//! ## Weight key paths
//!
//! ```text
//! fullLstm.{weight_ih,weight_hh,bias_ih,bias_hh}_l0[_reverse]
//! narrLstm.{weight_ih,weight_hh,bias_ih,bias_hh}_l0[_reverse]   (no _reverse when online)
//! ```

use candle_core::Tensor;
use candle_nn::{Dropout, VarBuilder};

use super::fold::{expect_dims, fold_freq, fold_time, unfold_freq, unfold_time};
use super::lstm::{BiLstm, Lstm};
use crate::config::Causality;
use crate::{Error, Result};

/// Where a block sits in a stack; decides the skip-combination strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPosition {
    /// Concatenates the raw block input to the narrow-band LSTM input.
    First,
    /// Adds the previous block's skips instead.
    Chained,
}

/// Configuration for one [`FusionBlock`].
#[derive(Debug, Clone)]
pub struct FusionBlockConfig {
    /// Feature width `C` of the block input.
    pub input_size: usize,
    /// Output width `H` of both LSTMs.
    pub hidden_size: usize,
    pub dropout: f32,
    pub causality: Causality,
    pub position: BlockPosition,
}

impl FusionBlockConfig {
    fn verify(&self) -> Result<()> {
        if self.hidden_size == 0 || self.hidden_size % 2 != 0 {
            return Err(Error::Config(format!(
                "fusion block hidden_size must be a positive even number, got {}",
                self.hidden_size
            )));
        }
        if self.position == BlockPosition::Chained && self.input_size != self.hidden_size {
            // Skips are added elementwise, so widths must agree.
            return Err(Error::Config(format!(
                "chained fusion block needs input_size == hidden_size, got {} and {}",
                self.input_size, self.hidden_size
            )));
        }
        Ok(())
    }
}

/// Skip tensors passed from one block to the next (both pre-dropout).
#[derive(Debug, Clone)]
pub struct BlockSkips {
    /// Full-band LSTM output, `[B·T, F, H]`.
    pub full_band: Tensor,
    /// Narrow-band LSTM output, `[B·F, T, H]`.
    pub narrow_band: Tensor,
}

/// Result of [`FusionBlock::forward`].
#[derive(Debug, Clone)]
pub struct BlockOutput {
    /// `[B, T, F, H]`.
    pub output: Tensor,
    pub skips: BlockSkips,
}

/// Narrow-band LSTM variants. Online and offline blocks own differently
/// shaped weights, so the choice is made once at construction.
#[derive(Debug, Clone)]
enum NarrowBand {
    Bidirectional(BiLstm),
    Causal(Lstm),
}

impl NarrowBand {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Bidirectional(lstm) => lstm.forward(x),
            Self::Causal(lstm) => lstm.forward(x),
        }
    }
}

/// One full-band / narrow-band fusion block.
#[derive(Debug, Clone)]
pub struct FusionBlock {
    full_lstm: BiLstm,
    narrow_lstm: NarrowBand,
    dropout_full: Dropout,
    dropout_narrow: Dropout,
    input_size: usize,
    hidden_size: usize,
    position: BlockPosition,
}

impl FusionBlock {
    /// Build the block, creating or loading weights through `vb`.
    pub fn new(cfg: &FusionBlockConfig, vb: VarBuilder) -> Result<Self> {
        cfg.verify()?;
        let half = cfg.hidden_size / 2;
        let full_lstm = BiLstm::load(vb.pp("fullLstm"), cfg.input_size, half)?;

        let narrow_input = match cfg.position {
            BlockPosition::First => full_lstm.output_size() + cfg.input_size,
            BlockPosition::Chained => full_lstm.output_size(),
        };
        let narrow_vb = vb.pp("narrLstm");
        let narrow_lstm = match cfg.causality {
            Causality::Offline => {
                NarrowBand::Bidirectional(BiLstm::load(narrow_vb, narrow_input, half)?)
            }
            Causality::Online => {
                NarrowBand::Causal(Lstm::load(narrow_vb, narrow_input, cfg.hidden_size)?)
            }
        };

        Ok(Self {
            full_lstm,
            narrow_lstm,
            dropout_full: Dropout::new(cfg.dropout),
            dropout_narrow: Dropout::new(cfg.dropout),
            input_size: cfg.input_size,
            hidden_size: cfg.hidden_size,
            position: cfg.position,
        })
    }

    pub fn position(&self) -> BlockPosition {
        self.position
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, T, F, C]` with `C == input_size`
    /// - `skips`: previous block's skips; ignored by a first block and
    ///   required by a chained one
    /// - `train`: apply dropout
    ///
    /// Returns `[B, T, F, H]` plus the new skips.
    #[tracing::instrument(name = "fusion_block", skip_all)]
    pub fn forward(
        &self,
        x: &Tensor,
        skips: Option<&BlockSkips>,
        train: bool,
    ) -> Result<BlockOutput> {
        let (b, t, f, c) = x.dims4()?;
        if c != self.input_size {
            return Err(Error::ShapeMismatch(format!(
                "fusion block expects {} input features, got {c}",
                self.input_size
            )));
        }
        let skips = match self.position {
            BlockPosition::First => None,
            BlockPosition::Chained => Some(skips.ok_or_else(|| {
                Error::Config("chained fusion block called without skip tensors".into())
            })?),
        };
        let h = self.hidden_size;

        // Full-band: sequence over frequency, one frame per row.
        let mut xs = fold_time(x)?;
        if let Some(skips) = skips {
            expect_dims(&skips.full_band, &[b * t, f, h], "full-band skip")?;
            xs = (xs + &skips.full_band)?;
        }
        let full = self.full_lstm.forward(&xs)?;
        let xs = self.dropout_full.forward(&full, train)?;

        // Narrow-band: sequence over time, one frequency bin per row.
        let xs = fold_freq(&unfold_time(&xs, b, t)?)?;
        let xs = match skips {
            None => Tensor::cat(&[&xs, &fold_freq(x)?], 2)?,
            Some(skips) => {
                expect_dims(&skips.narrow_band, &[b * f, t, h], "narrow-band skip")?;
                (xs + &skips.narrow_band)?
            }
        };
        let narrow = self.narrow_lstm.forward(&xs)?;
        let xs = self.dropout_narrow.forward(&narrow, train)?;

        let output = unfold_freq(&xs, b, f)?;
        tracing::debug!(
            "fusion block: [{b}, {t}, {f}, {c}] -> {:?} (train={train})",
            output.dims()
        );

        Ok(BlockOutput {
            output,
            skips: BlockSkips {
                full_band: full,
                narrow_band: narrow,
            },
        })
    }
}
