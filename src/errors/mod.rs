//! Error type definitions for the crawl orchestration service.
//!
//! One hierarchical error enum with typed sentinels; callers branch on
//! the variant, never on message strings.

mod types;

pub use types::{AppError, SourceClientError};

/// Convenience alias used throughout the service layer.
pub type Result<T> = std::result::Result<T, AppError>;
