use thiserror::Error;

/// Comprehensive error type for the ceremony orchestrator and proof service.
#[derive(Debug, Error)]
pub enum Error {
    // --- Ceremony errors ---
    #[error("Stage `{stage}` is missing required input: {input}")]
    MissingInput { stage: String, input: String },

    #[error("Stage `{stage}` failed: {reason}")]
    StageExecutionFailed { stage: String, reason: String },

    #[error("Ceremony instance `{0}` has failed and cannot be resumed; start a new instance")]
    CeremonyFailed(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid stage plan: {0}")]
    InvalidPlan(String),

    // --- Store errors ---
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Artifact `{slot}` v{version} failed digest verification")]
    CorruptArtifact { slot: String, version: u64 },

    // --- Proof service errors ---
    #[error("Unknown circuit: {0}")]
    UnknownCircuit(String),

    #[error("Parameters for circuit `{0}` are not ready")]
    ParametersNotReady(String),

    #[error("Prover failed: {0}")]
    ProverExecutionFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // --- Infrastructure ---
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration parsing error (TOML): {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Serialization error (JSON): {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Serialization error (Bincode): {0}")]
    BincodeError(#[from] Box<bincode::ErrorKind>),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("State management error: {0}")]
    StateError(String),

    #[error("Could not acquire lock: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingInput { .. } => "MISSING_INPUT",
            Error::StageExecutionFailed { .. } => "STAGE_EXECUTION_FAILED",
            Error::CeremonyFailed(_) => "CEREMONY_FAILED",
            Error::Cancelled(_) => "CANCELLED",
            Error::InvalidPlan(_) => "INVALID_PLAN",
            Error::NotFound(_) => "NOT_FOUND",
            Error::CorruptArtifact { .. } => "CORRUPT_ARTIFACT",
            Error::UnknownCircuit(_) => "UNKNOWN_CIRCUIT",
            Error::ParametersNotReady(_) => "PARAMETERS_NOT_READY",
            Error::ProverExecutionFailed(_) => "PROVER_EXECUTION_FAILED",
            Error::InvalidInput(_) => "INVALID_REQUEST",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ParametersNotReady(_) | Error::Cancelled(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::LockError(format!("Mutex/RwLock poisoned: {}", e))
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::StateError(format!("sled: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_readiness_and_cancellation_are_retryable() {
        assert!(Error::ParametersNotReady("c".into()).is_retryable());
        assert!(Error::Cancelled("shutdown".into()).is_retryable());
        assert!(!Error::UnknownCircuit("c".into()).is_retryable());
        assert!(
            !Error::StageExecutionFailed {
                stage: "init".into(),
                reason: "exit 1".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn poisoned_lock_maps_to_lock_error() {
        let m = std::sync::Arc::new(std::sync::Mutex::new(()));
        let m2 = m.clone();
        let _ = std::thread::spawn(move || {
            let _g = m2.lock().unwrap();
            panic!("poison");
        })
        .join();
        let err: Error = m.lock().unwrap_err().into();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(matches!(err, Error::LockError(_)));
    }
}
