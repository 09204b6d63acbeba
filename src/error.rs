use serde_derive::{Deserialize, Serialize};

/// A shardkv error. The coordinator itself is total over well-formed inputs
/// and returns no errors; violated state invariants are bugs and panic via
/// assertions instead. Errors are returned at the edges: configuration
/// validation and diff encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid data, e.g. encoding failures.
    InvalidData(String),
    /// Invalid user input, e.g. a malformed table configuration.
    InvalidInput(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) | Error::InvalidInput(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

/// A shardkv result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
