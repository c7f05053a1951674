use std::time::Duration;

use async_trait::async_trait;

use super::Monitor;
use crate::engine::LifecycleEngine;
use crate::error::Result;

/// Deletes unleased messages past their expiration time.
pub struct ExpirationMonitor {
    engine: LifecycleEngine,
}

impl ExpirationMonitor {
    pub fn new(engine: LifecycleEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Monitor for ExpirationMonitor {
    fn name(&self) -> &'static str {
        "expiration"
    }

    fn interval(&self) -> Duration {
        self.engine.options().expiration.monitor_interval()
    }

    async fn tick(&self) -> Result<usize> {
        Ok(self.engine.remove_expired().await?.len())
    }
}
