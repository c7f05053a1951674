//! Domain model (ids, message record, columns, events, status views).

pub mod columns;
pub mod events;
pub mod ids;
pub mod message;
pub mod status;

pub use columns::{AdditionalColumns, ColumnDefinition, ColumnSchema, ColumnType, ColumnValue};
pub use events::LifecycleEvent;
pub use ids::{CorrelationId, QueueId};
pub use message::{
    EnqueueOptions, ErrorTrackingRecord, MessageRecord, MessageStatus, MetaDataErrorsRecord,
    NewMessage,
};
pub use status::{QueueCounts, StatusRecord};

use chrono::{DateTime, TimeZone, Utc};

/// Truncate to millisecond precision, which is what every backend persists.
pub fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(at.timestamp_millis())
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Out-of-range values clamp to the epoch rather than failing a read.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
