use thiserror::Error;

/// Errors that can occur in the segmentation engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// IO error occurred (file operations, sockets, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport error (peer disconnected, frame too large, etc.)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A peer sent a message that does not fit the job protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Input volumes or label sets failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Array shapes or element types do not agree
    #[error("Shape error: {0}")]
    Shape(String),

    /// No device of the requested platform could be bound
    #[error("No {0} device found.")]
    DeviceNotFound(String),

    /// A device allocation did not fit the available memory
    #[error("Out of memory: {0}")]
    MemoryExhausted(String),

    /// Kernel or post-processing failure
    #[error("Execution error: {0}")]
    Execution(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<toml::ser::Error> for EngineError {
    fn from(e: toml::ser::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl<T: std::fmt::Debug> From<ciborium::ser::Error<T>> for EngineError {
    fn from(e: ciborium::ser::Error<T>) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl<T: std::fmt::Debug> From<ciborium::de::Error<T>> for EngineError {
    fn from(e: ciborium::de::Error<T>) -> Self {
        EngineError::Serialization(e.to_string())
    }
}
