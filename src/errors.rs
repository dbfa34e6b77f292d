//! Structured error types for the CDC pipeline.
//! Provides error handling using thiserror for better error reporting.

use thiserror::Error;

/// Top-level error type for the pipeline.
#[derive(Error, Debug)]
pub enum CdcError {
    /// Configuration related errors (missing file, bad YAML, empty password).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Database connection related errors.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Replication protocol parse errors (frame/logical-message level).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Tuple value decode errors.
    #[error("decode error: {message}")]
    Decode { message: String },

    /// A data message referenced a relation_id absent from the cache.
    #[error("unknown relation: {relation_id}")]
    UnknownRelation { relation_id: u32 },

    /// Sink/producer errors.
    #[error("sink error: {message}")]
    Sink { message: String },

    /// Checkpoint file read/write errors.
    #[error("checkpoint error: {message}")]
    Checkpoint { message: String },

    /// Buffer operation errors (short reads/writes against the wire buffers).
    #[error("buffer error: {message}")]
    BufferOperation { message: String },

    #[error("network IO error")]
    NetworkIO(#[from] std::io::Error),

    #[error("string conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CdcResult<T> = std::result::Result<T, CdcError>;

impl CdcError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode { message: message.into() }
    }

    pub fn buffer<S: Into<String>>(message: S) -> Self {
        Self::BufferOperation { message: message.into() }
    }

    pub fn sink<S: Into<String>>(message: S) -> Self {
        Self::Sink { message: message.into() }
    }

    pub fn checkpoint<S: Into<String>>(message: S) -> Self {
        Self::Checkpoint { message: message.into() }
    }
}
