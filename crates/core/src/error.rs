use thiserror::Error;
use uuid::Uuid;

pub type UpliftResult<T> = Result<T, UpliftError>;

#[derive(Error, Debug)]
pub enum UpliftError {
    #[error("Experiment {0} not found")]
    ExperimentNotFound(Uuid),

    #[error("Experiment {0} is not running")]
    ExperimentNotRunning(Uuid),

    #[error("Variant {0} not found")]
    VariantNotFound(Uuid),

    #[error("Experiment {0} has no active variants")]
    NoActiveVariants(Uuid),

    #[error("No candidate arms to sample")]
    NoCandidates,

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("State codec error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage circuit open for {0}")]
    CircuitOpen(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl UpliftError {
    /// Whether a retry at the storage boundary could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpliftError::Storage(_))
    }
}
