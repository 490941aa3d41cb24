//! Error taxonomy for the detection event store.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by [`EventStore`](crate::store::EventStore) backends and the
/// [`StatisticsEngine`](crate::statistics::StatisticsEngine).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached (connect, pool or transport failure).
    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    /// A single document was refused (schema or size violation, constraint failure).
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// One or more indexes could not be created. Queries still work, only slower.
    #[error("Index creation failed for: {}", .0.join(", "))]
    IndexCreationFailed(Vec<String>),

    /// A read-side operation failed.
    #[error("Query `{operation}` failed ({filters}): {reason}")]
    QueryFailed {
        operation: &'static str,
        filters: String,
        reason: String,
    },

    /// Destructive purge attempted without explicit confirmation.
    #[error("Purging events older than {cutoff} requires explicit confirmation")]
    PurgeConfirmationRequired { cutoff: DateTime<Utc> },

    /// Query parameters are malformed (e.g. an inverted time range).
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl StoreError {
    pub(crate) fn query_failed(
        operation: &'static str,
        filters: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        StoreError::QueryFailed {
            operation,
            filters: filters.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error means the store itself is gone, as opposed to a single
    /// request being refused.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::StoreUnavailable(_))
    }
}
