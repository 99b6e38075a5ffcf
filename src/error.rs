//! Error types for the Kolosal ensemble engine

use thiserror::Error;

/// Result type alias for ensemble operations
pub type Result<T> = std::result::Result<T, KolosalError>;

/// Main error type for the ensemble engine
#[derive(Error, Debug)]
pub enum KolosalError {
    /// A caller-supplied argument violated a precondition
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A sub-model failed while producing a prediction
    #[error("Inference failed in sub-model {model_index}: {source}")]
    InferenceFailure {
        model_index: usize,
        #[source]
        source: Box<KolosalError>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl KolosalError {
    /// Wrap an error raised by the sub-model at `model_index`.
    pub fn inference(model_index: usize, source: KolosalError) -> Self {
        KolosalError::InferenceFailure {
            model_index,
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for KolosalError {
    fn from(err: serde_json::Error) -> Self {
        KolosalError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for KolosalError {
    fn from(err: ndarray::ShapeError) -> Self {
        KolosalError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}
