//! Status - 読み取り側のビュー（ステータステーブル、件数）

use serde::{Deserialize, Serialize};

use super::ids::{CorrelationId, QueueId};
use super::message::MessageStatus;

/// Row of the optional status table, one per queue id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub queue_id: QueueId,
    pub correlation_id: CorrelationId,
    pub status: MessageStatus,
    pub job_name: Option<String>,
}

/// Snapshot of how many messages sit in each lifecycle bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Waiting and ready now.
    pub waiting: u64,
    /// Leased by a worker.
    pub processing: u64,
    /// Waiting with `process_at` in the future.
    pub delayed: u64,
    /// In the error queue.
    pub error: u64,
}

impl QueueCounts {
    /// Messages still in the live table.
    pub fn live(&self) -> u64 {
        self.waiting + self.processing + self.delayed
    }
}
