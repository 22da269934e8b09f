use thiserror::Error;

/// Crate-wide error type. Every public operation that can fail returns one
/// of these kinds together with a line of human-readable context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed configuration, out-of-range id, unknown variable.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Operation called in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// External artifact problem: file access, parse, decode.
    #[error("operation failed: {0}")]
    OpFail(String),

    /// A record buffer overflowed on emission.
    #[error("record buffer too small: {0}")]
    BufTooSmall(String),

    /// A label was not found in the current configuration.
    #[error("element not found: {0}")]
    EleNotFound(String),

    /// A non-existent fragment, segment or location id.
    #[error("invalid id: {0}")]
    InvalidId(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::OpFail(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::OpFail(e.to_string())
    }
}
