#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use leaseq_core::domain::{MessageRecord, QueueCounts, QueueId};
use leaseq_core::impls::{InMemoryStore, SqliteStore};
use leaseq_core::ports::{ManualClock, MemoryEventSink, StoreAdapter};
use leaseq_core::{HandlerError, LifecycleEngine, MessageHandler, QueueOptions};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
    /// Runs only with the `redis` feature and `LEASEQ_REDIS_URL` set.
    Redis,
}

pub struct Harness {
    pub engine: LifecycleEngine,
    pub clock: Arc<ManualClock>,
    pub events: Arc<MemoryEventSink>,
    _dir: Option<TempDir>,
}

/// `None` when the backend is not available in this run.
pub async fn harness(backend: Backend, options: QueueOptions) -> Option<Harness> {
    let (store, dir): (Arc<dyn StoreAdapter>, Option<TempDir>) = match backend {
        Backend::Memory => (Arc::new(InMemoryStore::new(&options)), None),
        Backend::Sqlite => {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteStore::open(dir.path().join("queue.db"), &options)
                .await
                .unwrap();
            (Arc::new(store), Some(dir))
        }
        Backend::Redis => (redis_store(&options).await?, None),
    };
    assert!(store.create().await.unwrap());

    let clock = Arc::new(ManualClock::starting_now());
    let events = Arc::new(MemoryEventSink::new());
    let engine = LifecycleEngine::new(store, options)
        .unwrap()
        .with_clock(clock.clone())
        .with_event_sink(events.clone());
    Some(Harness {
        engine,
        clock,
        events,
        _dir: dir,
    })
}

/// A fresh namespace per call, so runs never see each other's keys.
#[cfg(feature = "redis")]
async fn redis_store(options: &QueueOptions) -> Option<Arc<dyn StoreAdapter>> {
    let url = std::env::var("LEASEQ_REDIS_URL").ok()?;
    let namespace = format!("leaseq-test-{}", uuid::Uuid::new_v4().simple());
    let store = leaseq_core::impls::RedisStore::connect(&url, &namespace, options)
        .await
        .unwrap();
    Some(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_options: &QueueOptions) -> Option<Arc<dyn StoreAdapter>> {
    None
}

/// Records every delivery and answers with a fixed outcome.
pub struct RecordingHandler {
    pub seen: Mutex<Vec<QueueId>>,
    outcome: Result<(), HandlerError>,
}

impl RecordingHandler {
    pub fn new(outcome: Result<(), HandlerError>) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            outcome,
        })
    }

    pub fn deliveries(&self) -> Vec<QueueId> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &MessageRecord) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(message.queue_id);
        tokio::task::yield_now().await;
        self.outcome.clone()
    }
}

/// Poll counts until `done` holds or five seconds pass.
pub async fn wait_for(engine: &LifecycleEngine, done: impl Fn(QueueCounts) -> bool) {
    for _ in 0..500 {
        if done(engine.counts().await.unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue did not settle: {:?}", engine.counts().await.unwrap());
}
