//! Model components for FN-SSL.
//!
//! ## Components
//!
//! - [`fold`] — axis fold/unfold between block and LSTM layouts
//! - [`lstm`] — unidirectional and bidirectional single-layer LSTMs
//! - [`block`] — full-band / narrow-band fusion block
//! - [`network`] — block stack with the IPD and DOA heads

pub mod block;
pub mod fold;
pub mod lstm;
pub mod network;

pub use block::{BlockOutput, BlockPosition, BlockSkips, FusionBlock, FusionBlockConfig};
pub use network::LocalizationNetwork;
