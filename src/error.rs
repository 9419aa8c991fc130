//! Unified error hierarchy for calmsense
//!
//! Session-level failures are absorbed into terminal session states; the
//! errors here are what crosses the API boundary between the core and its
//! collaborators (sample source, key-value store, configuration).

use thiserror::Error;

use crate::hrv::HrvError;

/// Top-level error type for all calmsense operations
#[derive(Debug, Error)]
pub enum CalmError {
    /// Access to heart-rate data was refused by the platform
    #[error("Authorization denied: {reason}")]
    AuthorizationDenied { reason: String },

    /// Not enough usable heart-rate samples to compute HRV
    #[error("Insufficient samples: {usable} usable, {required} required")]
    InsufficientSamples { usable: usize, required: usize },

    /// Training measurements must say how the user feels
    #[error("A stressed/calm label is required while training")]
    LabelRequired,

    /// Sample source query failures
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Key-value persistence failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures reported by a sample source while answering a query
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    /// The underlying health store is not reachable
    #[error("Sample store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The query did not complete in time
    #[error("Query timed out")]
    Timeout,

    /// Transport or storage level failure
    #[error("Transport failure: {reason}")]
    Transport { reason: String },
}

/// Key-value store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite backend failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored value could not be encoded or decoded
    #[error("Serialization error for {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// Any other backend failure
    #[error("Backend error: {reason}")]
    Backend { reason: String },
}

/// Result type alias for calmsense operations
pub type Result<T> = std::result::Result<T, CalmError>;

impl From<HrvError> for CalmError {
    fn from(err: HrvError) -> Self {
        match err {
            HrvError::InsufficientSamples { usable, required } => {
                CalmError::InsufficientSamples { usable, required }
            }
        }
    }
}

impl CalmError {
    /// Check if error is retryable within a capture session
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CalmError::InsufficientSamples { .. } | CalmError::Query(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CalmError::InsufficientSamples { .. } => ErrorSeverity::Info,
            CalmError::Query(_) => ErrorSeverity::Warning,
            CalmError::AuthorizationDenied { .. } => ErrorSeverity::Warning,
            CalmError::Configuration(_) => ErrorSeverity::Warning,
            CalmError::LabelRequired => ErrorSeverity::Warning,
            CalmError::Store(_) => ErrorSeverity::Error,
            CalmError::Io(_) => ErrorSeverity::Error,
            CalmError::Internal(_) => ErrorSeverity::Critical,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            CalmError::AuthorizationDenied { .. } => {
                "Heart rate access is turned off. Allow access to start measuring.".to_string()
            }
            CalmError::InsufficientSamples { .. } => {
                "Not enough heart rate data yet. Keep still and try again.".to_string()
            }
            CalmError::LabelRequired => {
                "Tell us whether you feel stressed or calm before measuring.".to_string()
            }
            CalmError::Query(_) => {
                "Heart rate data is temporarily unavailable.".to_string()
            }
            CalmError::Store(_) => {
                "Unable to save calibration data. Please check available storage.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}
