//! HeartbeatMonitor - 期限切れ lease の回収
//!
//! `heartbeat < now - lease_timeout` のまま Processing に残っているメッセージを
//! Waiting に戻す。更新は store 側で「まだ Processing か」を条件にして行う。

use std::time::Duration;

use async_trait::async_trait;

use super::Monitor;
use crate::engine::LifecycleEngine;
use crate::error::Result;

pub struct HeartbeatMonitor {
    engine: LifecycleEngine,
}

impl HeartbeatMonitor {
    pub fn new(engine: LifecycleEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Monitor for HeartbeatMonitor {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn interval(&self) -> Duration {
        self.engine.options().heartbeat.monitor_interval()
    }

    async fn tick(&self) -> Result<usize> {
        Ok(self.engine.reset_expired_heartbeats().await?.len())
    }
}
