//! QueueBuilder - キューの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `build()` でオプションを検証し、store に接続する
//! - 不正な設定はメッセージが流れる前に `QueueError::Configuration` になる

use std::sync::Arc;

use super::Queue;
use crate::config::{LeaseqConfig, QueueOptions, StoreConfig};
use crate::engine::LifecycleEngine;
use crate::error::Result;
use crate::impls::open_store;
use crate::ports::{Clock, EventSink, StoreAdapter};

/// QueueBuilder は Queue を構築
///
/// # 使用例
/// ```ignore
/// let queue = QueueBuilder::new(QueueOptions::new("orders"))
///     .store_config(StoreConfig::Sqlite { path: Some("q.db".into()), max_connections: 5, busy_timeout_ms: 5000 })
///     .build()
///     .await?;
/// ```
pub struct QueueBuilder {
    options: QueueOptions,
    store_config: StoreConfig,
    store: Option<Arc<dyn StoreAdapter>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventSink>>,
}

impl QueueBuilder {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            store_config: StoreConfig::default(),
            store: None,
            clock: None,
            events: None,
        }
    }

    pub fn from_config(config: LeaseqConfig) -> Self {
        Self::new(config.queue).store_config(config.store)
    }

    pub fn store_config(mut self, store_config: StoreConfig) -> Self {
        self.store_config = store_config;
        self
    }

    /// Use an already-open store instead of `store_config`.
    pub fn store(mut self, store: Arc<dyn StoreAdapter>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn build(self) -> Result<Queue> {
        self.options.validate()?;
        let store = match self.store {
            Some(store) => store,
            None => open_store(&self.store_config, &self.options).await?,
        };

        let mut engine = LifecycleEngine::new(store, self.options)?;
        if let Some(clock) = self.clock {
            engine = engine.with_clock(clock);
        }
        if let Some(events) = self.events {
            engine = engine.with_event_sink(events);
        }
        Ok(Queue::from_engine(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::impls::InMemoryStore;

    #[tokio::test]
    async fn build_fails_fast_on_invalid_options() {
        let mut options = QueueOptions::new("orders");
        options.heartbeat.renew_interval_ms = options.heartbeat.lease_timeout_ms;
        let result = QueueBuilder::new(options).build().await;
        assert!(matches!(result, Err(QueueError::Configuration(_))));
    }

    #[tokio::test]
    async fn explicit_store_wins_over_config() {
        let options = QueueOptions::new("orders");
        let store = Arc::new(InMemoryStore::new(&options));
        let queue = QueueBuilder::new(options)
            .store_config(StoreConfig::Redis {
                url: "redis://unreachable.invalid/".into(),
                namespace: "leaseq".into(),
            })
            .store(store)
            .build()
            .await
            .unwrap();
        assert_eq!(queue.engine().store().kind(), "memory");
    }

    #[tokio::test]
    async fn from_config_reads_toml() {
        let config = LeaseqConfig::from_toml_str(
            r#"
            [store]
            backend = "memory"

            [queue]
            name = "invoices"
            enable_priority = true
            "#,
        )
        .unwrap();
        let queue = QueueBuilder::from_config(config).build().await.unwrap();
        assert_eq!(queue.name(), "invoices");
        assert!(queue.options().enable_priority);
    }
}
