//! In-memory store implementation.
//!
//! One async mutex serializes every operation, which is what makes each
//! method atomic. Nothing survives the process.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::QueueOptions;
use crate::domain::{
    CorrelationId, ErrorTrackingRecord, MessageRecord, MessageStatus, MetaDataErrorsRecord,
    NewMessage, QueueCounts, QueueId, StatusRecord,
};
use crate::error::{QueueError, Result};
use crate::ports::store::{DequeueRequest, PurgeFilter, StoreAdapter};

/// Dequeue order: higher priority first, then lower id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey(Reverse<Option<u8>>, QueueId);

impl ReadyKey {
    fn of(record: &MessageRecord) -> Self {
        Self(Reverse(record.priority), record.queue_id)
    }
}

/// Delayed message entry for the scheduled heap.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledMessage {
    process_at: DateTime<Utc>,
    queue_id: QueueId,
}

impl PartialOrd for ScheduledMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier times have higher priority
        other
            .process_at
            .cmp(&self.process_at)
            .then_with(|| other.queue_id.cmp(&self.queue_id))
    }
}

#[derive(Default)]
struct InMemoryState {
    created: bool,

    /// Live records (single source of truth).
    records: HashMap<QueueId, MessageRecord>,

    /// Waiting, due, unleased records.
    ready: BTreeSet<ReadyKey>,

    /// Waiting records with `process_at` in the future. May hold stale
    /// entries; they are re-checked against the record when popped.
    scheduled: BinaryHeap<ScheduledMessage>,

    errors: BTreeMap<QueueId, MetaDataErrorsRecord>,
    tracking: HashMap<QueueId, BTreeMap<String, u32>>,
    status: HashMap<QueueId, StatusRecord>,
    next_id: i64,
}

impl InMemoryState {
    fn allocate_id(&mut self) -> QueueId {
        self.next_id += 1;
        QueueId::new(self.next_id)
    }

    /// Move scheduled records to ready if their time has come.
    fn promote_scheduled(&mut self, now: DateTime<Utc>, limit: usize) -> u64 {
        let mut promoted = 0;
        while promoted < limit as u64 {
            let Some(entry) = self.scheduled.peek() else {
                break;
            };
            if entry.process_at > now {
                break; // Heap is sorted, so we can stop
            }
            let queue_id = entry.queue_id;
            self.scheduled.pop();

            let Some(record) = self.records.get(&queue_id) else {
                continue;
            };
            if record.is_leased() || record.process_at > now {
                continue;
            }
            if self.ready.insert(ReadyKey::of(record)) {
                promoted += 1;
            }
        }
        promoted
    }

    /// Put a waiting record back where dequeue or promotion will find it.
    fn requeue(&mut self, queue_id: QueueId, due: bool) {
        let Some(record) = self.records.get(&queue_id) else {
            return;
        };
        if due {
            self.ready.insert(ReadyKey::of(record));
        } else {
            self.scheduled.push(ScheduledMessage {
                process_at: record.process_at,
                queue_id,
            });
        }
    }

    fn set_status(&mut self, queue_id: QueueId, status: MessageStatus) {
        if let Some(row) = self.status.get_mut(&queue_id) {
            row.status = status;
        }
    }

    fn error_counts(&self, queue_id: QueueId) -> Vec<ErrorTrackingRecord> {
        self.tracking
            .get(&queue_id)
            .map(|counts| {
                counts
                    .iter()
                    .map(|(exception_type, retry_count)| ErrorTrackingRecord {
                        queue_id,
                        exception_type: exception_type.clone(),
                        retry_count: *retry_count,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop a live record and everything attached to it.
    fn delete(&mut self, queue_id: QueueId) -> Option<MessageRecord> {
        let record = self.records.remove(&queue_id)?;
        self.ready.remove(&ReadyKey::of(&record));
        self.tracking.remove(&queue_id);
        self.status.remove(&queue_id);
        Some(record)
    }
}

/// Embedded single-writer store.
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
    status_table: bool,
}

impl InMemoryStore {
    pub fn new(options: &QueueOptions) -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            status_table: options.enable_status_table,
        }
    }
}

#[async_trait]
impl StoreAdapter for InMemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn create(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.created {
            return Ok(false);
        }
        state.created = true;
        Ok(true)
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().await.created)
    }

    async fn remove(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = InMemoryState::default();
        Ok(())
    }

    async fn enqueue(&self, message: NewMessage) -> Result<QueueId> {
        let mut state = self.state.lock().await;
        let queue_id = state.allocate_id();
        let due = message.process_at <= message.queued_at;
        let record = message.into_record(queue_id);

        if self.status_table {
            state.status.insert(
                queue_id,
                StatusRecord {
                    queue_id,
                    correlation_id: record.correlation_id,
                    status: MessageStatus::Waiting,
                    job_name: record.job_name.clone(),
                },
            );
        }
        state.records.insert(queue_id, record);
        state.requeue(queue_id, due);
        Ok(queue_id)
    }

    async fn dequeue(&self, request: &DequeueRequest) -> Result<Option<MessageRecord>> {
        let mut state = self.state.lock().await;
        state.promote_scheduled(request.now, usize::MAX);

        let route = request.route.as_deref();
        let picked = state.ready.iter().copied().find(|key| {
            state
                .records
                .get(&key.1)
                .is_some_and(|record| record.is_eligible(request.now, route))
        });
        let Some(key) = picked else {
            return Ok(None);
        };
        state.ready.remove(&key);

        let error_counts = state.error_counts(key.1);
        let Some(record) = state.records.get_mut(&key.1) else {
            return Ok(None);
        };
        record.lease(request.now);
        record.error_counts = error_counts;
        let leased = record.clone();
        state.set_status(key.1, MessageStatus::Processing);
        Ok(Some(leased))
    }

    async fn complete(&self, queue_id: QueueId) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .delete(queue_id)
            .map(|_| ())
            .ok_or(QueueError::NotFound(queue_id))
    }

    async fn rollback(&self, queue_id: QueueId, process_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&queue_id) else {
            return Err(QueueError::NotFound(queue_id));
        };
        let old_key = ReadyKey::of(record);
        record.release(process_at);

        state.ready.remove(&old_key);
        state.set_status(queue_id, MessageStatus::Waiting);
        // A pushed-forward message waits in the heap; promotion re-checks the time.
        state.requeue(queue_id, process_at.is_none());
        Ok(())
    }

    async fn send_heartbeat(&self, queue_id: QueueId, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(&queue_id) {
            Some(record) if record.is_leased() => {
                record.heartbeat = Some(now);
                Ok(())
            }
            _ => Err(QueueError::NotFound(queue_id)),
        }
    }

    async fn reset_expired_heartbeats(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueId>> {
        let mut state = self.state.lock().await;
        let mut stale: Vec<QueueId> = state
            .records
            .values()
            .filter(|r| r.status == MessageStatus::Processing)
            .filter(|r| r.heartbeat.is_some_and(|hb| hb < cutoff))
            .map(|r| r.queue_id)
            .collect();
        stale.sort();
        stale.truncate(limit);

        for queue_id in &stale {
            let Some(record) = state.records.get_mut(queue_id) else {
                continue;
            };
            record.release(None);
            let key = ReadyKey::of(record);
            state.ready.insert(key);
            state.set_status(*queue_id, MessageStatus::Waiting);
        }
        Ok(stale)
    }

    async fn record_error(&self, queue_id: QueueId, exception_type: &str) -> Result<u32> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(&queue_id) {
            return Err(QueueError::NotFound(queue_id));
        }
        let count = state
            .tracking
            .entry(queue_id)
            .or_default()
            .entry(exception_type.to_string())
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn move_to_error_queue(
        &self,
        queue_id: QueueId,
        exception: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.remove(&queue_id) else {
            return Err(QueueError::NotFound(queue_id));
        };
        state.ready.remove(&ReadyKey::of(&record));
        state.set_status(queue_id, MessageStatus::Error);
        state
            .errors
            .insert(queue_id, record.into_error_record(exception, now));
        Ok(())
    }

    async fn promote_delayed(&self, now: DateTime<Utc>, limit: usize) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(state.promote_scheduled(now, limit))
    }

    async fn remove_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueId>> {
        let mut state = self.state.lock().await;
        let mut expired: Vec<QueueId> = state
            .records
            .values()
            .filter(|r| !r.is_leased() && r.is_expired(now))
            .map(|r| r.queue_id)
            .collect();
        expired.sort();
        expired.truncate(limit);
        for queue_id in &expired {
            state.delete(*queue_id);
        }
        Ok(expired)
    }

    async fn purge_error_messages(&self, filter: PurgeFilter) -> Result<u64> {
        let mut state = self.state.lock().await;
        let purged: Vec<QueueId> = state
            .errors
            .values()
            .filter(|e| filter.matches(e.last_exception_at))
            .map(|e| e.queue_id)
            .collect();
        for queue_id in &purged {
            state.errors.remove(queue_id);
            state.tracking.remove(queue_id);
            state.status.remove(queue_id);
        }
        Ok(purged.len() as u64)
    }

    async fn status(&self, correlation_id: CorrelationId) -> Result<Option<StatusRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .status
            .values()
            .filter(|row| row.correlation_id == correlation_id)
            .max_by_key(|row| row.queue_id)
            .cloned())
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.records.values() {
            if record.is_leased() {
                counts.processing += 1;
            } else if record.process_at > now {
                counts.delayed += 1;
            } else {
                counts.waiting += 1;
            }
        }
        counts.error = state.errors.len() as u64;
        Ok(counts)
    }

    async fn error_messages(&self, limit: usize) -> Result<Vec<MetaDataErrorsRecord>> {
        let state = self.state.lock().await;
        Ok(state.errors.values().take(limit).cloned().collect())
    }

    async fn error_tracking(&self, queue_id: QueueId) -> Result<Vec<ErrorTrackingRecord>> {
        let state = self.state.lock().await;
        Ok(state.error_counts(queue_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AdditionalColumns;
    use chrono::TimeDelta;

    fn new_message(now: DateTime<Utc>) -> NewMessage {
        NewMessage {
            correlation_id: CorrelationId::new(),
            body: b"hello".to_vec(),
            headers: Vec::new(),
            queued_at: now,
            process_at: now,
            expires_at: None,
            route: None,
            priority: None,
            job_name: Some("greeting".into()),
            columns: AdditionalColumns::new(),
        }
    }

    fn store() -> InMemoryStore {
        let mut options = QueueOptions::default();
        options.enable_status_table = true;
        InMemoryStore::new(&options)
    }

    fn request(now: DateTime<Utc>) -> DequeueRequest {
        DequeueRequest { now, route: None }
    }

    #[tokio::test]
    async fn create_reports_existing_queue() {
        let store = store();
        assert!(!store.exists().await.unwrap());
        assert!(store.create().await.unwrap());
        assert!(!store.create().await.unwrap());
        assert!(store.exists().await.unwrap());
        store.remove().await.unwrap();
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn dequeue_leases_once() {
        let store = store();
        let now = Utc::now();
        let id = store.enqueue(new_message(now)).await.unwrap();

        let leased = store.dequeue(&request(now)).await.unwrap().unwrap();
        assert_eq!(leased.queue_id, id);
        assert_eq!(leased.status, MessageStatus::Processing);
        assert_eq!(leased.heartbeat, Some(now));
        assert_eq!(leased.delivery_count, 1);

        assert!(store.dequeue(&request(now)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scheduled_messages_wait_for_their_time() {
        let store = store();
        let now = Utc::now();
        let mut message = new_message(now);
        message.process_at = now + TimeDelta::seconds(5);
        store.enqueue(message).await.unwrap();

        assert!(store.dequeue(&request(now)).await.unwrap().is_none());
        let counts = store.counts(now).await.unwrap();
        assert_eq!(counts.delayed, 1);

        let later = now + TimeDelta::seconds(6);
        assert_eq!(store.promote_delayed(later, 10).await.unwrap(), 1);
        assert!(store.dequeue(&request(later)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn priority_beats_fifo() {
        let store = store();
        let now = Utc::now();
        let mut low = new_message(now);
        low.priority = Some(1);
        let mut high = new_message(now);
        high.priority = Some(9);
        store.enqueue(low).await.unwrap();
        let high_id = store.enqueue(high).await.unwrap();

        let first = store.dequeue(&request(now)).await.unwrap().unwrap();
        assert_eq!(first.queue_id, high_id);
    }

    #[tokio::test]
    async fn rollback_with_backoff_goes_back_to_the_heap() {
        let store = store();
        let now = Utc::now();
        let id = store.enqueue(new_message(now)).await.unwrap();
        store.dequeue(&request(now)).await.unwrap().unwrap();

        store
            .rollback(id, Some(now + TimeDelta::seconds(2)))
            .await
            .unwrap();
        assert!(store.dequeue(&request(now)).await.unwrap().is_none());

        let later = now + TimeDelta::seconds(2);
        let again = store.dequeue(&request(later)).await.unwrap().unwrap();
        assert_eq!(again.queue_id, id);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn heartbeat_requires_a_lease() {
        let store = store();
        let now = Utc::now();
        let id = store.enqueue(new_message(now)).await.unwrap();
        assert!(store.send_heartbeat(id, now).await.unwrap_err().is_not_found());

        store.dequeue(&request(now)).await.unwrap().unwrap();
        store.send_heartbeat(id, now).await.unwrap();
    }

    #[tokio::test]
    async fn error_queue_keeps_tracking_until_purge() {
        let store = store();
        let now = Utc::now();
        let message = new_message(now);
        let correlation_id = message.correlation_id;
        let id = store.enqueue(message).await.unwrap();
        store.dequeue(&request(now)).await.unwrap().unwrap();

        assert_eq!(store.record_error(id, "Boom").await.unwrap(), 1);
        assert_eq!(store.record_error(id, "Boom").await.unwrap(), 2);
        store.move_to_error_queue(id, "Boom: failed", now).await.unwrap();

        let status = store.status(correlation_id).await.unwrap().unwrap();
        assert_eq!(status.status, MessageStatus::Error);
        assert_eq!(store.error_tracking(id).await.unwrap()[0].retry_count, 2);
        assert!(store.complete(id).await.unwrap_err().is_not_found());

        assert_eq!(store.purge_error_messages(PurgeFilter::All).await.unwrap(), 1);
        assert!(store.error_tracking(id).await.unwrap().is_empty());
        assert!(store.error_messages(10).await.unwrap().is_empty());
    }
}
