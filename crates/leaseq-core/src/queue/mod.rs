//! Queue facade: one named queue with its store, engine, monitors, producers
//! and workers.
//!
//! Design intent:
//! - The engine does the state transitions; the facade only wires things up.
//! - Monitors are owned by the queue instance, so two queues in one process
//!   never share timers.

mod builder;

pub use builder::QueueBuilder;

use std::sync::Arc;

use tracing::{error, info};

use crate::config::QueueOptions;
use crate::engine::LifecycleEngine;
use crate::error::{QueueError, Result};
use crate::monitor::MonitorHandle;
use crate::ports::{ExponentialRetryPolicy, RetryPolicy};
use crate::typed::{Handler, Payload, Producer, TypedHandler};
use crate::worker::{MessageHandler, WorkerGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCreationStatus {
    Success,
    AlreadyExists,
    ConfigurationError,
    Failed,
}

/// Structured outcome of `Queue::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCreationResult {
    pub success: bool,
    pub status: QueueCreationStatus,
    pub message: String,
}

impl QueueCreationResult {
    fn new(status: QueueCreationStatus, message: impl Into<String>) -> Self {
        Self {
            success: status == QueueCreationStatus::Success,
            status,
            message: message.into(),
        }
    }

    fn from_error(err: &QueueError) -> Self {
        let status = match err {
            QueueError::Configuration(_) => QueueCreationStatus::ConfigurationError,
            _ => QueueCreationStatus::Failed,
        };
        Self::new(status, err.to_string())
    }
}

pub struct Queue {
    engine: LifecycleEngine,
    monitors: Option<MonitorHandle>,
}

impl Queue {
    pub fn builder(options: QueueOptions) -> QueueBuilder {
        QueueBuilder::new(options)
    }

    pub(crate) fn from_engine(engine: LifecycleEngine) -> Self {
        Self {
            engine,
            monitors: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.engine.options().name
    }

    pub fn options(&self) -> &QueueOptions {
        self.engine.options()
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    /// Create the queue's tables/keys and persist its options.
    pub async fn create(&self) -> QueueCreationResult {
        if let Err(e) = self.options().validate() {
            return QueueCreationResult::from_error(&e.into());
        }
        match self.engine.store().create().await {
            Ok(true) => {
                info!(queue = %self.name(), store = self.engine.store().kind(), "queue created");
                QueueCreationResult::new(QueueCreationStatus::Success, "queue created")
            }
            Ok(false) => QueueCreationResult::new(
                QueueCreationStatus::AlreadyExists,
                format!("queue `{}` already exists", self.name()),
            ),
            Err(e) => {
                error!(queue = %self.name(), error = %e, "queue creation failed");
                QueueCreationResult::from_error(&e)
            }
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        self.engine.store().exists().await
    }

    /// Stop the monitors and drop everything the queue owns in the store.
    pub async fn remove(&mut self) -> Result<()> {
        self.stop_monitors().await;
        self.engine.store().remove().await?;
        info!(queue = %self.name(), "queue removed");
        Ok(())
    }

    /// Start the heartbeat, delayed-processing and expiration monitors the
    /// options enable. Calling it twice is a no-op.
    pub fn start_monitors(&mut self) {
        if self.monitors.is_none() {
            self.monitors = Some(MonitorHandle::start(&self.engine));
        }
    }

    pub fn monitors_running(&self) -> bool {
        self.monitors.is_some()
    }

    pub async fn stop_monitors(&mut self) {
        if let Some(monitors) = self.monitors.take() {
            monitors.shutdown().await;
        }
    }

    pub fn producer<T: Payload>(&self) -> Producer<T> {
        Producer::new(self.engine.clone())
    }

    /// Retry policy built from the queue's `retry` options.
    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        Arc::new(ExponentialRetryPolicy::from_options(&self.options().retry))
    }

    /// Byte-level workers using the queue's `worker` and `retry` options.
    pub fn spawn_workers(&self, handler: Arc<dyn MessageHandler>) -> WorkerGroup {
        self.spawn_workers_with(handler, self.retry_policy())
    }

    pub fn spawn_workers_with(
        &self,
        handler: Arc<dyn MessageHandler>,
        retry: Arc<dyn RetryPolicy>,
    ) -> WorkerGroup {
        WorkerGroup::spawn(self.engine.clone(), handler, retry, &self.options().worker)
    }

    /// Typed workers for a queue that carries a single payload type.
    pub fn consume<T: Payload, H: Handler<T>>(&self, handler: H) -> WorkerGroup {
        self.spawn_workers(Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub async fn shutdown(mut self) {
        self.stop_monitors().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    #[tokio::test]
    async fn create_reports_existing_queue() {
        let queue = Queue::builder(QueueOptions::new("orders"))
            .store_config(StoreConfig::Memory)
            .build()
            .await
            .unwrap();
        assert!(!queue.exists().await.unwrap());

        let first = queue.create().await;
        assert!(first.success);
        assert_eq!(first.status, QueueCreationStatus::Success);

        let second = queue.create().await;
        assert!(!second.success);
        assert_eq!(second.status, QueueCreationStatus::AlreadyExists);
        assert!(queue.exists().await.unwrap());
    }

    #[test]
    fn configuration_errors_are_classified() {
        let result =
            QueueCreationResult::from_error(&QueueError::configuration("conflicting flags"));
        assert!(!result.success);
        assert_eq!(result.status, QueueCreationStatus::ConfigurationError);

        let result = QueueCreationResult::from_error(&QueueError::store_write("create", "disk full"));
        assert_eq!(result.status, QueueCreationStatus::Failed);
    }

    #[tokio::test]
    async fn monitors_start_once_and_stop_on_remove() {
        let mut queue = Queue::builder(QueueOptions::new("orders")).build().await.unwrap();
        queue.create().await;
        queue.start_monitors();
        queue.start_monitors();
        assert!(queue.monitors_running());

        queue.remove().await.unwrap();
        assert!(!queue.monitors_running());
        assert!(!queue.exists().await.unwrap());
    }
}
