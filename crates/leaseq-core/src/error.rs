use thiserror::Error;

use crate::domain::QueueId;

/// Boxed backend error (sqlx, redis, io, ...).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the lifecycle engine and the store adapters.
///
/// Store failures are never retried by the core: the caller (worker loop or
/// monitor tick) logs them and tries again on its next iteration.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store write failed during {operation}: {source}")]
    StoreWrite {
        operation: &'static str,
        source: BoxError,
    },

    #[error("store read failed during {operation}: {source}")]
    StoreRead {
        operation: &'static str,
        source: BoxError,
    },

    /// The message was already completed, expired or moved to the error queue.
    #[error("message {0} not found")]
    NotFound(QueueId),

    /// The leased body/headers can never be turned into a processable message.
    #[error("poison message {queue_id}: {reason}")]
    Poison { queue_id: QueueId, reason: String },

    /// Another caller won the race for this message.
    #[error("lease conflict on message {0}")]
    LeaseConflict(QueueId),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    pub fn store_write(operation: &'static str, source: impl Into<BoxError>) -> Self {
        Self::StoreWrite {
            operation,
            source: source.into(),
        }
    }

    pub fn store_read(operation: &'static str, source: impl Into<BoxError>) -> Self {
        Self::StoreRead {
            operation,
            source: source.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Transient backend failures; everything else is a logical outcome.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::StoreWrite { .. } | Self::StoreRead { .. })
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_source() {
        let io = std::io::Error::other("disk on fire");
        let err = QueueError::store_write("enqueue", io);
        assert!(err.is_store_error());
        assert!(err.to_string().contains("enqueue"));
        assert!(err.to_string().contains("disk on fire"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn not_found_is_benign() {
        let err = QueueError::NotFound(QueueId::new(7));
        assert!(err.is_not_found());
        assert!(!err.is_store_error());
        assert_eq!(err.to_string(), "message 7 not found");
    }
}
