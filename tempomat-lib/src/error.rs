use thiserror::Error;

/// Failure modes of the library: an unusable config file, socket-level
/// IO, a backend URI that cannot be forwarded to, upstream HTTP
/// failures, and introspection RPC errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid backend URI: {0}")]
    InvalidBackend(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("RPC error: {0}")]
    Rpc(String),
}

pub type Result<T> = std::result::Result<T, Error>;
