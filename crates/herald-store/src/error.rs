use thiserror::Error;

/// Errors returned by store operations and snapshot persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("value at {0} is not an integer")]
    NotAnInteger(String),
    #[error("value at {0} holds the wrong kind of value")]
    WrongType(String),
    #[error("failed to encode store snapshot: {0}")]
    Encode(String),
    #[error("failed to decode store snapshot: {0}")]
    Decode(String),
    #[error("failed to read snapshot file: {0}")]
    Read(std::io::Error),
    #[error("failed to write snapshot file: {0}")]
    Write(std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
