use thiserror::Error;

/// Top-level application error type.
///
/// The variants double as the error-kind sentinels the event pipeline
/// and the HTTP layer dispatch on: `Validation` is non-retryable,
/// `NotFound`/`Duplicate` are recorded-and-skipped by event handlers,
/// `Transient` is returned unrecorded so the stream redelivers.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Source client errors
    #[error("Source client error: {0}")]
    SourceClient(#[from] SourceClientError),

    /// Bad input or structurally invalid payload; never retried
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Resource absent
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Uniqueness violation, e.g. replaying an already-recorded event
    #[error("Duplicate: {resource} with id {id}")]
    Duplicate { resource: String, id: String },

    /// Temporary failure; the caller may retry or redeliver
    #[error("Transient error: {message}")]
    Transient { message: String },

    /// Corrupt state or invariant violation; abort, never retry
    #[error("Fatal error: {message}")]
    Fatal { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors surfaced by the source catalog client.
#[derive(Error, Debug)]
pub enum SourceClientError {
    #[error("source {0} not found")]
    NotFound(uuid::Uuid),

    #[error("source catalog unavailable: {message}")]
    Unavailable { message: String },

    #[error("source catalog returned malformed data: {message}")]
    Malformed { message: String },
}

impl AppError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn duplicate<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::Duplicate {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// True when re-delivery may succeed. Event handlers leave the
    /// ledger untouched for these so the stream redelivers.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Transient { .. } => true,
            AppError::Database(_) => true,
            AppError::Http(_) => true,
            AppError::SourceClient(SourceClientError::Unavailable { .. }) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::NotFound { .. } | AppError::SourceClient(SourceClientError::NotFound(_))
        )
    }
}
