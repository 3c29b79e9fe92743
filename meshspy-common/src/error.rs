use thiserror::Error;

/// Common error type for MeshSpy components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed record: {0}")]
    Malformed(#[from] crate::codec::MalformedRecord),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using MeshSpy's Error.
pub type Result<T> = std::result::Result<T, Error>;
