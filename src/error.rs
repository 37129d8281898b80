//! Error types for fn-ssl-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// A tensor does not have the shape an axis fold, unfold or layer expects.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Invalid or inconsistent configuration.
    #[error("config: {0}")]
    Config(String),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
