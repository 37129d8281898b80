//! Configuration for the FN-SSL localization network.
//!
//! Defaults match the published single-block model: 4 input feature
//! channels, 256 frequency bins, hidden width 256, pooling window 12 and
//! 180 direction-of-arrival classes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Temporal causality of the narrow-band (time-axis) LSTM.
///
/// The full-band LSTM sees a single frame at a time and is always
/// bidirectional over frequency, so this is the only causality switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Causality {
    /// Bidirectional over time, `hidden / 2` units per direction.
    #[default]
    Offline,
    /// Unidirectional over time with `hidden` units: streaming-safe.
    Online,
}

/// Top-level network configuration.
///
/// Every field has a default, so a JSON file only needs the fields it
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FnSslConfig {
    /// Feature channels per time-frequency bin (microphone pair features).
    pub input_size: usize,
    /// Width of both LSTM outputs.
    pub hidden_size: usize,
    /// Dropout probability after each LSTM (training only).
    pub dropout: f32,
    /// Online (causal) or offline (bidirectional) narrow-band modelling.
    pub causality: Causality,
    /// Project the IPD features to DOA class logits.
    pub doa: bool,
    /// Number of chained fusion blocks.
    pub num_blocks: usize,
    /// Non-overlapping average pooling window along time.
    pub pool_window: usize,
    /// Frequency bins of the input. Fixes the DOA projection width; the
    /// IPD head works with any bin count.
    pub num_freqs: usize,
    /// Number of DOA classes on the angular grid.
    pub num_classes: usize,
}

impl Default for FnSslConfig {
    fn default() -> Self {
        Self {
            input_size: 4,
            hidden_size: 256,
            dropout: 0.2,
            causality: Causality::Offline,
            doa: false,
            num_blocks: 1,
            pool_window: 12,
            num_freqs: 256,
            num_classes: 180,
        }
    }
}

impl FnSslConfig {
    /// Read a JSON config file and check it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.verify()?;
        Ok(cfg)
    }

    /// Check that the configuration describes a buildable network.
    pub fn verify(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(Error::Config("input_size must be positive".into()));
        }
        if self.hidden_size == 0 || self.hidden_size % 2 != 0 {
            return Err(Error::Config(format!(
                "hidden_size must be a positive even number, got {}",
                self.hidden_size
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.num_blocks == 0 {
            return Err(Error::Config("num_blocks must be at least 1".into()));
        }
        if self.pool_window == 0 {
            return Err(Error::Config("pool_window must be at least 1".into()));
        }
        if self.num_freqs == 0 {
            return Err(Error::Config("num_freqs must be positive".into()));
        }
        if self.doa && self.num_classes == 0 {
            return Err(Error::Config("num_classes must be positive".into()));
        }
        Ok(())
    }

    /// Number of pooled output frames for `frames` input frames.
    ///
    /// Frames past the last full pooling window are dropped.
    pub fn output_frames(&self, frames: usize) -> usize {
        frames / self.pool_window
    }

    /// Feature width of the network output for `num_freqs` input bins.
    pub fn output_width(&self) -> usize {
        if self.doa {
            self.num_classes
        } else {
            2 * self.num_freqs
        }
    }

    /// Total number of learned parameters.
    pub fn parameter_count(&self) -> usize {
        let h = self.hidden_size;
        let mut total = 0;
        for index in 0..self.num_blocks {
            let (input, narrow_input) = if index == 0 {
                (self.input_size, h + self.input_size)
            } else {
                (h, h)
            };
            total += 2 * lstm_parameters(input, h / 2);
            total += match self.causality {
                Causality::Offline => 2 * lstm_parameters(narrow_input, h / 2),
                Causality::Online => lstm_parameters(narrow_input, h),
            };
        }
        total += h * 2 + 2;
        if self.doa {
            total += 2 * self.num_freqs * self.num_classes + self.num_classes;
        }
        total
    }
}

/// Parameters of one LSTM direction: two weight matrices and two biases.
fn lstm_parameters(input: usize, hidden: usize) -> usize {
    4 * hidden * (input + hidden) + 8 * hidden
}
