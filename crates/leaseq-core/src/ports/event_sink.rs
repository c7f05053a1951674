//! EventSink port - ライフサイクルイベントの通知
//!
//! - `TracingEventSink`: tracing へ出力
//! - `NoopEventSink`: 何もしない
//! - `MemoryEventSink`: 受け取ったイベントを保持（テスト・デモ用）

use std::sync::Mutex;

use tracing::{debug, warn};

use crate::domain::LifecycleEvent;

/// Fire-and-forget: `emit` cannot fail, and it runs after the store commit.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &LifecycleEvent) {}
}

/// Logs every event; poison and error-queue moves at `warn`, the rest at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &LifecycleEvent) {
        let queue_id = event.queue_id().map(|id| id.as_i64());
        match event {
            LifecycleEvent::Poisoned { reason, .. } => {
                warn!(event = event.name(), ?queue_id, %reason, "poison message quarantined");
            }
            LifecycleEvent::MovedToErrorQueue { exception, .. } => {
                warn!(event = event.name(), ?queue_id, %exception, "message moved to error queue");
            }
            other => {
                debug!(event = other.name(), ?queue_id, detail = ?other, "lifecycle event");
            }
        }
    }
}

/// Keeps every event in order.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(LifecycleEvent::name).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &LifecycleEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
    }
}
