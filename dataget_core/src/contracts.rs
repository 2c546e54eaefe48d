use serde::{Deserialize, Serialize};
use serde_json::Value;

/// # NDOC
/// component: `contracts`
/// purpose: Standard result alias used across the pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// # NDOC
/// component: `contracts`
/// purpose: Stable machine-readable pipeline error category.
/// invariants:
///   - Variants are part of the alarm-card surface; changes require compatibility review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigError,
    AuthExpired,
    AuthInteractiveRequired,
    RateLimited,
    Transient,
    Invalid,
    DataAnomaly,
    SinkError,
    StorageError,
    InternalError,
}

impl ErrorKind {
    /// Alarm severity this error kind maps to when surfaced on a card.
    pub fn alarm_level(&self) -> AlarmLevel {
        match self {
            ErrorKind::AuthInteractiveRequired | ErrorKind::SinkError => AlarmLevel::Error,
            ErrorKind::Invalid | ErrorKind::DataAnomaly => AlarmLevel::Warning,
            ErrorKind::ConfigError | ErrorKind::StorageError | ErrorKind::InternalError => {
                AlarmLevel::Error
            }
            ErrorKind::AuthExpired | ErrorKind::RateLimited | ErrorKind::Transient => {
                AlarmLevel::Warning
            }
        }
    }
}

/// Severity of an alarm card posted to the alert webhook.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlarmLevel {
    Info,
    Warning,
    Error,
}

impl AlarmLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmLevel::Info => "info",
            AlarmLevel::Warning => "warning",
            AlarmLevel::Error => "error",
        }
    }
}

/// # NDOC
/// component: `contracts`
/// purpose: Canonical error payload used across adapters, stores, and sinks.
/// invariants:
///   - `message` is user-safe and lands verbatim on alarm cards.
///   - `retryable` indicates whether automated retry is acceptable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub details: Option<Value>,
}

impl PipelineError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        retryable: bool,
        details: Option<Value>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            details,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigError, message, false, None)
    }

    // Recoverable by one credential refresh, never by blind re-send; the
    // refresh path keys off the kind, so the retry flag stays false.
    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthExpired, message, false, None)
    }

    pub fn auth_interactive(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthInteractiveRequired, message, false, None)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message, true, None)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message, true, None)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message, false, None)
    }

    pub fn anomaly(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataAnomaly, message, false, None)
    }

    pub fn sink(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SinkError, message, false, None)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageError, message, false, None)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message, false, None)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_auth_expired(&self) -> bool {
        self.kind == ErrorKind::AuthExpired
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(value: std::io::Error) -> Self {
        PipelineError::storage(value.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(value: serde_json::Error) -> Self {
        PipelineError::invalid(value.to_string())
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(value: rusqlite::Error) -> Self {
        PipelineError::storage(value.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            PipelineError::new(ErrorKind::Transient, value.to_string(), true, None)
        } else {
            PipelineError::transient(value.to_string())
        }
    }
}
