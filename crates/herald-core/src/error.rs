use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error)]
pub enum HeraldError {
    /// Invalid caller input or malformed primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Decode/parsing failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Capacity limit outside its allowed range.
    #[error("invalid capacity limit: {0}")]
    CapacityLimit(String),
}
