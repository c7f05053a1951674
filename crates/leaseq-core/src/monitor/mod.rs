//! Monitors - バックグラウンドの自己修復ループ
//!
//! - **HeartbeatMonitor**: 期限切れ lease の回収
//! - **DelayedMonitor**: 遅延メッセージの昇格
//! - **ExpirationMonitor**: 期限切れメッセージの削除
//!
//! 各モニタは専用の tokio task で動き、`MonitorHandle` が所有する。
//! プロセス全体で共有される状態はない（キューごとに独立したタイマー）。

pub mod delayed;
pub mod expiration;
pub mod heartbeat;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::engine::LifecycleEngine;
use crate::error::Result;

pub use self::delayed::DelayedMonitor;
pub use self::expiration::ExpirationMonitor;
pub use self::heartbeat::HeartbeatMonitor;

/// One periodic maintenance pass over the store.
#[async_trait]
pub trait Monitor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Run one pass and return how many messages it touched.
    async fn tick(&self) -> Result<usize>;
}

/// Owns the running monitor tasks of one queue.
/// - `request_shutdown()` で停止を要求（実行中の tick は最後まで走る）
/// - `shutdown()` で全タスクの終了を待つ
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<(&'static str, JoinHandle<()>)>,
}

impl MonitorHandle {
    /// Start every monitor the queue options enable.
    pub fn start(engine: &LifecycleEngine) -> Self {
        let options = engine.options();
        let mut monitors: Vec<Box<dyn Monitor>> = Vec::new();
        if options.enable_heartbeat {
            monitors.push(Box::new(HeartbeatMonitor::new(engine.clone())));
        }
        if options.enable_delayed_processing {
            monitors.push(Box::new(DelayedMonitor::new(engine.clone())));
        }
        if options.enable_message_expiration {
            monitors.push(Box::new(ExpirationMonitor::new(engine.clone())));
        }
        Self::spawn(monitors)
    }

    pub fn spawn(monitors: Vec<Box<dyn Monitor>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = monitors
            .into_iter()
            .map(|monitor| {
                let name = monitor.name();
                let rx = shutdown_rx.clone();
                (name, tokio::spawn(run(monitor, rx)))
            })
            .collect();
        Self { shutdown_tx, joins }
    }

    /// Names of the monitors this handle started.
    pub fn names(&self) -> Vec<&'static str> {
        self.joins.iter().map(|(name, _)| *name).collect()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.request_shutdown();
        for (name, join) in self.joins {
            if let Err(e) = join.await {
                error!(monitor = name, error = %e, "monitor task panicked");
            }
        }
    }
}

async fn run(monitor: Box<dyn Monitor>, mut shutdown_rx: watch::Receiver<bool>) {
    let name = monitor.name();
    let mut ticker = tokio::time::interval(monitor.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(monitor = name, interval_ms = monitor.interval().as_millis() as u64, "monitor started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        // The pass is never raced against shutdown, so a store call always
        // finishes its atomic unit.
        match monitor.tick().await {
            Ok(0) => {}
            Ok(touched) => debug!(monitor = name, touched, "monitor pass"),
            Err(e) => error!(monitor = name, error = %e, "monitor pass failed"),
        }
    }

    info!(monitor = name, "monitor stopped");
}
