use std::time::Duration;

use async_trait::async_trait;

use super::Monitor;
use crate::engine::LifecycleEngine;
use crate::error::Result;

/// Moves due delayed messages where dequeue can find them. A no-op on
/// stores whose dequeue filters on `process_at` directly.
pub struct DelayedMonitor {
    engine: LifecycleEngine,
}

impl DelayedMonitor {
    pub fn new(engine: LifecycleEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Monitor for DelayedMonitor {
    fn name(&self) -> &'static str {
        "delayed"
    }

    fn interval(&self) -> Duration {
        self.engine.options().delayed.monitor_interval()
    }

    async fn tick(&self) -> Result<usize> {
        let promoted = self.engine.promote_delayed().await?;
        Ok(usize::try_from(promoted).unwrap_or(usize::MAX))
    }
}
