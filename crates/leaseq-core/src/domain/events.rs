//! Events - ライフサイクルイベント
//!
//! ストアへの書き込みが確定した後に `EventSink` へ通知される。
//! 通知の成否はライフサイクルの正しさに影響しない。

use std::time::Duration;

use super::ids::{CorrelationId, QueueId};

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Enqueued {
        queue_id: QueueId,
        correlation_id: CorrelationId,
        delayed: bool,
    },
    Leased {
        queue_id: QueueId,
        correlation_id: CorrelationId,
        delivery_count: u32,
    },
    Completed {
        queue_id: QueueId,
    },
    RolledBack {
        queue_id: QueueId,
        backoff: Option<Duration>,
    },
    HeartbeatReset {
        queue_id: QueueId,
    },
    Expired {
        queue_id: QueueId,
    },
    Promoted {
        count: u64,
    },
    ErrorRecorded {
        queue_id: QueueId,
        exception_type: String,
        retry_count: u32,
    },
    MovedToErrorQueue {
        queue_id: QueueId,
        exception: String,
    },
    Poisoned {
        queue_id: QueueId,
        reason: String,
    },
    ErrorsPurged {
        count: u64,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Enqueued { .. } => "enqueued",
            LifecycleEvent::Leased { .. } => "leased",
            LifecycleEvent::Completed { .. } => "completed",
            LifecycleEvent::RolledBack { .. } => "rolled_back",
            LifecycleEvent::HeartbeatReset { .. } => "heartbeat_reset",
            LifecycleEvent::Expired { .. } => "expired",
            LifecycleEvent::Promoted { .. } => "promoted",
            LifecycleEvent::ErrorRecorded { .. } => "error_recorded",
            LifecycleEvent::MovedToErrorQueue { .. } => "moved_to_error_queue",
            LifecycleEvent::Poisoned { .. } => "poisoned",
            LifecycleEvent::ErrorsPurged { .. } => "errors_purged",
        }
    }

    /// The message the event is about, if it concerns a single one.
    pub fn queue_id(&self) -> Option<QueueId> {
        match self {
            LifecycleEvent::Enqueued { queue_id, .. }
            | LifecycleEvent::Leased { queue_id, .. }
            | LifecycleEvent::Completed { queue_id }
            | LifecycleEvent::RolledBack { queue_id, .. }
            | LifecycleEvent::HeartbeatReset { queue_id }
            | LifecycleEvent::Expired { queue_id }
            | LifecycleEvent::ErrorRecorded { queue_id, .. }
            | LifecycleEvent::MovedToErrorQueue { queue_id, .. }
            | LifecycleEvent::Poisoned { queue_id, .. } => Some(*queue_id),
            LifecycleEvent::Promoted { .. } | LifecycleEvent::ErrorsPurged { .. } => None,
        }
    }
}
