//! Lifecycle engine.
//!
//! Applies message transitions through a `StoreAdapter`, stamping them with
//! the injected `Clock` and reporting each committed transition to the
//! `EventSink`. The engine holds no message state of its own; every
//! guarantee comes from the store's atomic operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::QueueOptions;
use crate::domain::{
    CorrelationId, EnqueueOptions, ErrorTrackingRecord, LifecycleEvent, MessageRecord,
    MetaDataErrorsRecord, NewMessage, QueueCounts, QueueId, StatusRecord,
};
use crate::error::{QueueError, Result};
use crate::ports::{
    Clock, DequeueRequest, EventSink, PurgeFilter, StoreAdapter, SystemClock, TracingEventSink,
};

#[derive(Clone)]
pub struct LifecycleEngine {
    store: Arc<dyn StoreAdapter>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    options: Arc<QueueOptions>,
    wake: Arc<Notify>,
}

impl std::fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("queue", &self.options.name)
            .field("store", &self.store.kind())
            .finish()
    }
}

/// `now + by`, failing instead of overflowing.
fn offset(now: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| QueueError::configuration(format!("duration {by:?} is out of range")))
}

impl LifecycleEngine {
    /// Engine with the system clock and a tracing event sink.
    pub fn new(store: Arc<dyn StoreAdapter>, options: QueueOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingEventSink),
            options: Arc::new(options),
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Signal fired when new work may be available in this process.
    pub fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn wake(&self, count: usize) {
        if count > 1 {
            self.wake.notify_waiters();
        }
        if count > 0 {
            self.wake.notify_one();
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.events.emit(&event);
    }

    fn check_enqueue_options(&self, options: &EnqueueOptions) -> Result<()> {
        if options.priority.is_some() && !self.options.enable_priority {
            return Err(QueueError::configuration(
                "priority given but priority is disabled for this queue",
            ));
        }
        if let Some(route) = &options.route {
            if !self.options.enable_routes {
                return Err(QueueError::configuration(
                    "route given but routes are disabled for this queue",
                ));
            }
            if route.is_empty() {
                return Err(QueueError::configuration("route must not be empty"));
            }
        }
        if options.delay.is_some() && !self.options.enable_delayed_processing {
            return Err(QueueError::configuration(
                "delay given but delayed processing is disabled for this queue",
            ));
        }
        if options.expiration.is_some() && !self.options.enable_message_expiration {
            return Err(QueueError::configuration(
                "expiration given but message expiration is disabled for this queue",
            ));
        }
        self.options.additional_columns.validate(&options.columns)
    }

    pub async fn enqueue(
        &self,
        body: Vec<u8>,
        headers: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<QueueId> {
        self.check_enqueue_options(&options)?;

        let now = self.clock.now();
        let process_at = match options.delay {
            Some(delay) => offset(now, delay)?,
            None => now,
        };
        let expiration = match options.expiration {
            Some(expiration) => Some(expiration),
            None if self.options.enable_message_expiration => {
                self.options.expiration.default_expiration()
            }
            None => None,
        };
        let expires_at = expiration.map(|e| offset(now, e)).transpose()?;
        let correlation_id = options.correlation_id.unwrap_or_default();

        let message = NewMessage {
            correlation_id,
            body,
            headers,
            queued_at: now,
            process_at,
            expires_at,
            route: options.route,
            priority: options.priority,
            job_name: options.job_name,
            columns: options.columns,
        };
        let queue_id = self.store.enqueue(message).await?;

        let delayed = process_at > now;
        debug!(queue = %self.options.name, %queue_id, %correlation_id, delayed, "enqueued");
        self.emit(LifecycleEvent::Enqueued {
            queue_id,
            correlation_id,
            delayed,
        });
        if !delayed {
            self.wake(1);
        }
        Ok(queue_id)
    }

    /// Lease the next eligible message. `None` means no work right now.
    pub async fn dequeue(&self, route: Option<&str>) -> Result<Option<MessageRecord>> {
        if route.is_some() && !self.options.enable_routes {
            return Err(QueueError::configuration(
                "route filter given but routes are disabled for this queue",
            ));
        }
        let request = DequeueRequest {
            now: self.clock.now(),
            route: route.map(str::to_string),
        };
        let record = match self.store.dequeue(&request).await {
            Ok(record) => record,
            Err(QueueError::LeaseConflict(queue_id)) => {
                debug!(queue = %self.options.name, %queue_id, "lost dequeue race");
                // Another candidate may still be ready.
                self.wake(1);
                None
            }
            Err(QueueError::Poison { queue_id, reason }) => {
                warn!(queue = %self.options.name, %queue_id, %reason, "leased message is unreadable");
                self.quarantine_poison(queue_id, &reason).await?;
                self.wake(1);
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(record) = &record {
            debug!(
                queue = %self.options.name,
                queue_id = %record.queue_id,
                delivery_count = record.delivery_count,
                "leased"
            );
            self.emit(LifecycleEvent::Leased {
                queue_id: record.queue_id,
                correlation_id: record.correlation_id,
                delivery_count: record.delivery_count,
            });
        }
        Ok(record)
    }

    pub async fn complete(&self, queue_id: QueueId) -> Result<()> {
        self.store.complete(queue_id).await?;
        debug!(queue = %self.options.name, %queue_id, "completed");
        self.emit(LifecycleEvent::Completed { queue_id });
        Ok(())
    }

    /// Release the lease. With a backoff the message becomes eligible again
    /// only after `now + backoff`.
    pub async fn rollback(&self, queue_id: QueueId, backoff: Option<Duration>) -> Result<()> {
        let process_at = backoff
            .map(|delay| offset(self.clock.now(), delay))
            .transpose()?;
        self.store.rollback(queue_id, process_at).await?;
        debug!(queue = %self.options.name, %queue_id, ?backoff, "rolled back");
        self.emit(LifecycleEvent::RolledBack { queue_id, backoff });
        if backoff.is_none() {
            self.wake(1);
        }
        Ok(())
    }

    /// Renew the lease and return the new heartbeat.
    pub async fn send_heartbeat(&self, queue_id: QueueId) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        self.store.send_heartbeat(queue_id, now).await?;
        Ok(now)
    }

    /// Count one more failure of `exception_type` and return the new count.
    pub async fn record_error(&self, queue_id: QueueId, exception_type: &str) -> Result<u32> {
        let retry_count = self.store.record_error(queue_id, exception_type).await?;
        self.emit(LifecycleEvent::ErrorRecorded {
            queue_id,
            exception_type: exception_type.to_string(),
            retry_count,
        });
        Ok(retry_count)
    }

    pub async fn move_to_error_queue(&self, queue_id: QueueId, exception: &str) -> Result<()> {
        self.store
            .move_to_error_queue(queue_id, exception, self.clock.now())
            .await?;
        debug!(queue = %self.options.name, %queue_id, exception, "moved to error queue");
        self.emit(LifecycleEvent::MovedToErrorQueue {
            queue_id,
            exception: exception.to_string(),
        });
        Ok(())
    }

    /// Terminal move for a message that can never be processed. The error
    /// tracking table is left untouched.
    pub async fn quarantine_poison(&self, queue_id: QueueId, reason: &str) -> Result<()> {
        self.store
            .move_to_error_queue(queue_id, reason, self.clock.now())
            .await?;
        self.emit(LifecycleEvent::Poisoned {
            queue_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub async fn purge_error_messages(&self, filter: PurgeFilter) -> Result<u64> {
        let count = self.store.purge_error_messages(filter).await?;
        if count > 0 {
            self.emit(LifecycleEvent::ErrorsPurged { count });
        }
        Ok(count)
    }

    /// One heartbeat monitor pass.
    pub async fn reset_expired_heartbeats(&self) -> Result<Vec<QueueId>> {
        let heartbeat = &self.options.heartbeat;
        let cutoff = TimeDelta::from_std(heartbeat.lease_timeout())
            .ok()
            .and_then(|timeout| self.clock.now().checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reset = self
            .store
            .reset_expired_heartbeats(cutoff, heartbeat.batch_size)
            .await?;
        for queue_id in &reset {
            warn!(queue = %self.options.name, queue_id = %queue_id, "lease expired, message reset");
            self.emit(LifecycleEvent::HeartbeatReset {
                queue_id: *queue_id,
            });
        }
        self.wake(reset.len());
        Ok(reset)
    }

    /// One delayed-processing monitor pass.
    pub async fn promote_delayed(&self) -> Result<u64> {
        let promoted = self
            .store
            .promote_delayed(self.clock.now(), self.options.delayed.batch_size)
            .await?;
        if promoted > 0 {
            self.emit(LifecycleEvent::Promoted { count: promoted });
            self.wake(usize::try_from(promoted).unwrap_or(usize::MAX));
        }
        Ok(promoted)
    }

    /// One expiration monitor pass.
    pub async fn remove_expired(&self) -> Result<Vec<QueueId>> {
        let removed = self
            .store
            .remove_expired(self.clock.now(), self.options.expiration.batch_size)
            .await?;
        for queue_id in &removed {
            self.emit(LifecycleEvent::Expired {
                queue_id: *queue_id,
            });
        }
        Ok(removed)
    }

    pub async fn status(&self, correlation_id: CorrelationId) -> Result<Option<StatusRecord>> {
        if !self.options.enable_status_table {
            return Err(QueueError::configuration(
                "status table is disabled for this queue",
            ));
        }
        self.store.status(correlation_id).await
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.store.counts(self.clock.now()).await
    }

    pub async fn error_messages(&self, limit: usize) -> Result<Vec<MetaDataErrorsRecord>> {
        self.store.error_messages(limit).await
    }

    pub async fn error_tracking(&self, queue_id: QueueId) -> Result<Vec<ErrorTrackingRecord>> {
        self.store.error_tracking(queue_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageStatus;
    use crate::impls::InMemoryStore;
    use crate::ports::{ManualClock, MemoryEventSink};

    struct Fixture {
        engine: LifecycleEngine,
        clock: Arc<ManualClock>,
        events: Arc<MemoryEventSink>,
    }

    fn fixture(options: QueueOptions) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let events = Arc::new(MemoryEventSink::new());
        let store = Arc::new(InMemoryStore::new(&options));
        let engine = LifecycleEngine::new(store, options)
            .unwrap()
            .with_clock(clock.clone())
            .with_event_sink(events.clone());
        Fixture {
            engine,
            clock,
            events,
        }
    }

    #[tokio::test]
    async fn disabled_features_are_rejected_at_enqueue() {
        let mut options = QueueOptions::new("orders");
        options.enable_delayed_processing = false;
        let f = fixture(options);

        let err = f
            .engine
            .enqueue(b"x".to_vec(), Vec::new(), EnqueueOptions::new().with_priority(3))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));

        let err = f
            .engine
            .enqueue(b"x".to_vec(), Vec::new(), EnqueueOptions::new().with_route("eu"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));

        let err = f
            .engine
            .enqueue(
                b"x".to_vec(),
                Vec::new(),
                EnqueueOptions::new().with_delay(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));

        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn default_expiration_applies_when_caller_sets_none() {
        let mut options = QueueOptions::new("orders");
        options.expiration.default_expiration_ms = Some(1_000);
        let f = fixture(options);

        f.engine
            .enqueue(b"x".to_vec(), Vec::new(), EnqueueOptions::new())
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(2));
        assert!(f.engine.dequeue(None).await.unwrap().is_none());
        assert_eq!(f.engine.remove_expired().await.unwrap().len(), 1);
        assert_eq!(f.events.names(), vec!["enqueued", "expired"]);
    }

    #[tokio::test]
    async fn rollback_with_backoff_delays_redelivery() {
        let f = fixture(QueueOptions::new("orders"));
        let id = f
            .engine
            .enqueue(b"x".to_vec(), Vec::new(), EnqueueOptions::new())
            .await
            .unwrap();
        let leased = f.engine.dequeue(None).await.unwrap().unwrap();
        assert_eq!(leased.queue_id, id);

        f.engine
            .rollback(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(f.engine.dequeue(None).await.unwrap().is_none());

        f.clock.advance(Duration::from_secs(5));
        let again = f.engine.dequeue(None).await.unwrap().unwrap();
        assert_eq!(again.queue_id, id);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn heartbeat_keeps_lease_until_renewals_stop() {
        let mut options = QueueOptions::new("orders");
        options.heartbeat.lease_timeout_ms = 3_000;
        options.heartbeat.renew_interval_ms = 1_000;
        let f = fixture(options);
        let id = f
            .engine
            .enqueue(b"x".to_vec(), Vec::new(), EnqueueOptions::new())
            .await
            .unwrap();
        f.engine.dequeue(None).await.unwrap().unwrap();

        f.clock.advance(Duration::from_secs(2));
        let renewed = f.engine.send_heartbeat(id).await.unwrap();
        assert_eq!(renewed, f.clock.now());
        f.clock.advance(Duration::from_secs(2));
        assert!(f.engine.reset_expired_heartbeats().await.unwrap().is_empty());

        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.engine.reset_expired_heartbeats().await.unwrap(), vec![id]);
        assert!(f.engine.send_heartbeat(id).await.unwrap_err().is_not_found());
        assert!(f.engine.dequeue(None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn poison_skips_error_tracking() {
        let mut options = QueueOptions::new("orders");
        options.enable_status_table = true;
        let f = fixture(options);
        let correlation_id = CorrelationId::new();
        let id = f
            .engine
            .enqueue(
                b"not json".to_vec(),
                Vec::new(),
                EnqueueOptions::new().with_correlation_id(correlation_id),
            )
            .await
            .unwrap();
        f.engine.dequeue(None).await.unwrap().unwrap();
        f.engine.quarantine_poison(id, "bad body").await.unwrap();

        let status = f.engine.status(correlation_id).await.unwrap().unwrap();
        assert_eq!(status.status, MessageStatus::Error);
        let errors = f.engine.error_messages(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].last_exception, "bad body");
        assert!(!f.events.names().contains(&"error_recorded"));
        assert!(f.events.names().contains(&"poisoned"));
    }

    #[tokio::test]
    async fn status_lookup_requires_status_table() {
        let f = fixture(QueueOptions::new("orders"));
        let err = f.engine.status(CorrelationId::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[tokio::test]
    async fn route_filter_requires_routes() {
        let f = fixture(QueueOptions::new("orders"));
        let err = f.engine.dequeue(Some("eu")).await.unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
    }
}
