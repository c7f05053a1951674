//! Message record and its lifecycle states.
//!
//! # 状態遷移
//! - Waiting -> Processing (dequeue で lease を取得)
//! - Processing -> (削除) (complete)
//! - Processing -> Waiting (rollback / heartbeat 期限切れ)
//! - Waiting -> (削除) (expiration)
//! - Processing -> Error (error queue へ移動、終端)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::columns::AdditionalColumns;
use super::ids::{CorrelationId, QueueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Eligible for dequeue once `process_at` has passed.
    Waiting,

    /// Leased by a worker (heartbeat is set).
    Processing,

    /// Moved to the error queue. Terminal.
    Error,
}

impl MessageStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            MessageStatus::Waiting => 0,
            MessageStatus::Processing => 1,
            MessageStatus::Error => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(MessageStatus::Waiting),
            1 => Some(MessageStatus::Processing),
            2 => Some(MessageStatus::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Waiting => "waiting",
            MessageStatus::Processing => "processing",
            MessageStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(MessageStatus::Waiting),
            "processing" => Some(MessageStatus::Processing),
            "error" => Some(MessageStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Error)
    }
}

/// Per-message knobs supplied by the producer.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub correlation_id: Option<CorrelationId>,
    pub delay: Option<Duration>,
    pub expiration: Option<Duration>,
    pub priority: Option<u8>,
    pub route: Option<String>,
    pub job_name: Option<String>,
    pub columns: AdditionalColumns,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    pub fn with_columns(mut self, columns: AdditionalColumns) -> Self {
        self.columns = columns;
        self
    }
}

/// A message with all timestamps resolved, ready for the store to assign an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub correlation_id: CorrelationId,
    pub body: Vec<u8>,
    pub headers: Vec<u8>,
    pub queued_at: DateTime<Utc>,
    pub process_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub route: Option<String>,
    pub priority: Option<u8>,
    pub job_name: Option<String>,
    pub columns: AdditionalColumns,
}

impl NewMessage {
    pub fn into_record(self, queue_id: QueueId) -> MessageRecord {
        MessageRecord {
            queue_id,
            correlation_id: self.correlation_id,
            body: self.body,
            headers: self.headers,
            status: MessageStatus::Waiting,
            queued_at: self.queued_at,
            process_at: self.process_at,
            heartbeat: None,
            expires_at: self.expires_at,
            route: self.route,
            priority: self.priority,
            job_name: self.job_name,
            columns: self.columns,
            delivery_count: 0,
            error_counts: Vec::new(),
        }
    }
}

/// The live message. Body and headers are opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub queue_id: QueueId,
    pub correlation_id: CorrelationId,
    pub body: Vec<u8>,
    pub headers: Vec<u8>,
    pub status: MessageStatus,
    pub queued_at: DateTime<Utc>,
    pub process_at: DateTime<Utc>,

    /// Non-null means leased.
    pub heartbeat: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub route: Option<String>,
    pub priority: Option<u8>,
    pub job_name: Option<String>,
    pub columns: AdditionalColumns,

    /// Number of times the message has been leased, current lease included.
    pub delivery_count: u32,

    /// Prior error counts, materialized on dequeue.
    pub error_counts: Vec<ErrorTrackingRecord>,
}

impl MessageRecord {
    pub fn is_leased(&self) -> bool {
        self.heartbeat.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Ready for dequeue at `now` for a worker filtering on `route`.
    pub fn is_eligible(&self, now: DateTime<Utc>, route: Option<&str>) -> bool {
        self.status == MessageStatus::Waiting
            && !self.is_leased()
            && self.process_at <= now
            && !self.is_expired(now)
            && route.is_none_or(|r| self.route.as_deref() == Some(r))
    }

    /// How many times `exception_type` has been recorded for this message.
    pub fn retry_count(&self, exception_type: &str) -> u32 {
        self.error_counts
            .iter()
            .find(|e| e.exception_type == exception_type)
            .map(|e| e.retry_count)
            .unwrap_or(0)
    }

    /// Take the lease.
    pub fn lease(&mut self, now: DateTime<Utc>) {
        self.status = MessageStatus::Processing;
        self.heartbeat = Some(now);
        self.delivery_count += 1;
    }

    /// Give the lease back, optionally pushing the ready time forward.
    pub fn release(&mut self, process_at: Option<DateTime<Utc>>) {
        self.status = MessageStatus::Waiting;
        self.heartbeat = None;
        if let Some(at) = process_at {
            self.process_at = at;
        }
    }

    pub fn into_error_record(
        self,
        exception: impl Into<String>,
        at: DateTime<Utc>,
    ) -> MetaDataErrorsRecord {
        MetaDataErrorsRecord {
            queue_id: self.queue_id,
            correlation_id: self.correlation_id,
            body: self.body,
            headers: self.headers,
            queued_at: self.queued_at,
            process_at: self.process_at,
            expires_at: self.expires_at,
            route: self.route,
            priority: self.priority,
            job_name: self.job_name,
            columns: self.columns,
            delivery_count: self.delivery_count,
            last_exception: exception.into(),
            last_exception_at: at,
        }
    }
}

/// Per-message, per-exception-type retry counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTrackingRecord {
    pub queue_id: QueueId,
    pub exception_type: String,
    pub retry_count: u32,
}

/// A message that reached the error queue.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaDataErrorsRecord {
    pub queue_id: QueueId,
    pub correlation_id: CorrelationId,
    pub body: Vec<u8>,
    pub headers: Vec<u8>,
    pub queued_at: DateTime<Utc>,
    pub process_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub route: Option<String>,
    pub priority: Option<u8>,
    pub job_name: Option<String>,
    pub columns: AdditionalColumns,
    pub delivery_count: u32,
    pub last_exception: String,
    pub last_exception_at: DateTime<Utc>,
}
