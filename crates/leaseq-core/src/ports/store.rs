//! StoreAdapter port - バックエンドごとの原子的な操作
//!
//! # 契約
//! - 各メソッドは単一の原子的な単位として実行される（トランザクション / Lua / Mutex）
//! - 時刻は呼び出し側（エンジン）の Clock から渡される
//! - 対象が存在しない場合は `QueueError::NotFound`
//!
//! # 実装
//! - `impls::memory::InMemoryStore`
//! - `impls::sqlite::SqliteStore` (feature `sqlite`)
//! - `impls::redis::RedisStore` (feature `redis`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    CorrelationId, ErrorTrackingRecord, MessageRecord, MetaDataErrorsRecord, NewMessage,
    QueueCounts, QueueId, StatusRecord,
};
use crate::error::Result;

/// What a worker asks for.
#[derive(Debug, Clone)]
pub struct DequeueRequest {
    pub now: DateTime<Utc>,
    pub route: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeFilter {
    All,
    /// Entries whose `last_exception_at` is strictly before the instant.
    OlderThan(DateTime<Utc>),
}

impl PurgeFilter {
    pub fn matches(&self, last_exception_at: DateTime<Utc>) -> bool {
        match self {
            PurgeFilter::All => true,
            PurgeFilter::OlderThan(cutoff) => last_exception_at < *cutoff,
        }
    }
}

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Create tables and persist the queue options. `Ok(false)` if it already existed.
    async fn create(&self) -> Result<bool>;

    async fn exists(&self) -> Result<bool>;

    /// Drop everything the queue owns.
    async fn remove(&self) -> Result<()>;

    async fn enqueue(&self, message: NewMessage) -> Result<QueueId>;

    /// Select, lock and mark the next eligible message in one atomic step.
    ///
    /// The returned record already carries `heartbeat = now`, `status = Processing`,
    /// the incremented delivery count and the prior error counts.
    ///
    /// `LeaseConflict` means the chosen candidate was claimed by someone else
    /// first. `Poison` means the lease was taken but the stored record cannot
    /// be decoded; the message stays leased for the caller to quarantine.
    async fn dequeue(&self, request: &DequeueRequest) -> Result<Option<MessageRecord>>;

    /// Delete the message, its status row and its error tracking rows.
    async fn complete(&self, queue_id: QueueId) -> Result<()>;

    /// Release the lease; `process_at` moves forward when given.
    async fn rollback(&self, queue_id: QueueId, process_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Renew a held lease. `NotFound` when the message is gone or not leased.
    async fn send_heartbeat(&self, queue_id: QueueId, now: DateTime<Utc>) -> Result<()>;

    /// Release leases whose heartbeat is older than `cutoff`, re-checking each
    /// record inside the atomic unit. Returns the ids actually reset.
    async fn reset_expired_heartbeats(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueId>>;

    /// Increment the counter for `(queue_id, exception_type)` and return it.
    async fn record_error(&self, queue_id: QueueId, exception_type: &str) -> Result<u32>;

    async fn move_to_error_queue(
        &self,
        queue_id: QueueId,
        exception: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Make due delayed messages visible. Stores that filter on `process_at`
    /// at dequeue time have nothing to move and return 0.
    async fn promote_delayed(&self, now: DateTime<Utc>, limit: usize) -> Result<u64>;

    /// Delete unleased messages with `expires_at <= now`.
    async fn remove_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueId>>;

    async fn purge_error_messages(&self, filter: PurgeFilter) -> Result<u64>;

    async fn status(&self, correlation_id: CorrelationId) -> Result<Option<StatusRecord>>;

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts>;

    /// Error-queue entries, oldest id first.
    async fn error_messages(&self, limit: usize) -> Result<Vec<MetaDataErrorsRecord>>;

    /// Retry counters of a message, live or in the error queue, by exception type.
    async fn error_tracking(&self, queue_id: QueueId) -> Result<Vec<ErrorTrackingRecord>>;
}
