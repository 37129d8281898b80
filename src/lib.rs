//! Full-band / narrow-band fusion network for sound source localization.
//!
//! A candle-based implementation of FN-SSL. The network reads multichannel
//! spectral features and produces per-frame interaural phase difference
//! (IPD) features, optionally projected to direction-of-arrival (DOA)
//! logits. Weight names follow the PyTorch model, so its safetensors
//! exports load directly.
//!
//! ## Architecture
//!
//! ```text
//! [B, 4, 256, T] ─ permute → [B, T, F, C]
//!                              ↓
//!             fusion block: fullLstm over F (per frame)
//!                           narrLstm over T (per bin, causal when online)
//!                              ↓
//!             avg pool over 12 frames → Linear(256, 2) → tanh
//!                              ↓
//!             [B, T/12, 512] IPD (real | imag)
//!                              ↓ (DOA mode)
//!             Linear(512, 180) → [B, T/12, 180]
//! ```
//!
//! ## Modules
//!
//! - [`config`] — network configuration and shape contract
//! - [`model`] — fold utilities, LSTMs, fusion block, network

pub mod config;
pub mod model;

mod error;

pub use config::{Causality, FnSslConfig};
pub use error::{Error, Result};
pub use model::LocalizationNetwork;
