//! Error types for the bolus_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for bolus_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid or missing input (bad clinical parameters, negative carbs/BG).
    /// Fatal, surfaced immediately, never retried automatically.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Degraded upstream data requires an explicit one-shot confirmation.
    /// Not a failure: retried once with the named flag set.
    #[error("CONFIRM_REQUIRED: set '{required_flag}' to proceed with degraded data")]
    ConfirmRequired { required_flag: &'static str },

    /// Division-by-zero or out-of-range model parameter; always fatal,
    /// never silently defaulted.
    #[error("Computation guard: {0}")]
    ComputationGuard(String),

    /// Persistent state error (dual-bolus plan, treatment log)
    #[error("State error: {0}")]
    State(String),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Flag name the caller must set to retry, when this is a gated state
    pub fn required_flag(&self) -> Option<&'static str> {
        match self {
            Error::ConfirmRequired { required_flag } => Some(required_flag),
            _ => None,
        }
    }
}
