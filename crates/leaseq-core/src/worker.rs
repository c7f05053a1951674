use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::WorkerOptions;
use crate::domain::MessageRecord;
use crate::engine::LifecycleEngine;
use crate::error::QueueError;
use crate::ports::RetryPolicy;

/// How a handler reports failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Counted against the retry budget of `exception_type`.
    #[error("{exception_type}: {message}")]
    Failed {
        exception_type: String,
        message: String,
    },

    /// The message can never be processed; it goes straight to the error queue.
    #[error("poison message: {0}")]
    Poison(String),
}

impl HandlerError {
    pub fn failed(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }

    pub fn poison(reason: impl Into<String>) -> Self {
        Self::Poison(reason.into())
    }

    /// Failure keyed by the error's type name (`WidgetError`, not its full path).
    pub fn from_error<E: std::error::Error + 'static>(error: E) -> Self {
        let full = std::any::type_name::<E>();
        let short = full.rsplit("::").next().unwrap_or(full);
        Self::failed(short, error.to_string())
    }
}

/// Byte-level handler. See `typed::TypedHandler` for the deserializing adapter.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &MessageRecord) -> Result<(), HandlerError>;
}

/// Worker group handle.
/// - `request_shutdown()` で新しい lease の取得を止める（実行中の handler は最後まで走る）
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

struct WorkerContext {
    engine: LifecycleEngine,
    handler: Arc<dyn MessageHandler>,
    retry: Arc<dyn RetryPolicy>,
    route: Option<String>,
    poll_interval: Duration,
}

impl WorkerGroup {
    /// Spawn `options.workers` workers.
    pub fn spawn(
        engine: LifecycleEngine,
        handler: Arc<dyn MessageHandler>,
        retry: Arc<dyn RetryPolicy>,
        options: &WorkerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = Arc::new(WorkerContext {
            engine,
            handler,
            retry,
            route: options.route.clone(),
            poll_interval: options.poll_interval(),
        });

        let n = options.workers.max(1);
        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let ctx = Arc::clone(&context);
            let mut rx = shutdown_rx.clone();
            let join = tokio::spawn(async move {
                worker_loop(worker_id, ctx, &mut rx).await;
            });
            joins.push(join);
        }

        info!(queue = %context.engine.options().name, workers = n, "worker group started");
        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new leases.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}

/// Poll interval scaled by a random factor in [0.5, 1.5).
fn jittered(poll_interval: Duration) -> Duration {
    poll_interval.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let wake = ctx.engine.wake_signal();
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // dequeue は shutdown と競合させない（lease を取ったまま捨てないため）
        let leased = match ctx.engine.dequeue(ctx.route.as_deref()).await {
            Ok(leased) => leased,
            Err(e) => {
                error!(worker_id, error = %e, "dequeue failed");
                None
            }
        };

        let Some(record) = leased else {
            // 待つのは idle 時のみ。enqueue の通知か poll 間隔のどちらか早い方で再評価
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = wake.notified() => {}
                _ = tokio::time::sleep(jittered(ctx.poll_interval)) => {}
            }
            continue;
        };

        process(worker_id, &ctx, record).await;
    }
    debug!(worker_id, "worker stopped");
}

/// Run the handler while renewing the lease every `renew_interval`.
async fn handle_with_heartbeat(
    worker_id: usize,
    ctx: &WorkerContext,
    record: &MessageRecord,
) -> Result<(), HandlerError> {
    let options = ctx.engine.options();
    if !options.enable_heartbeat {
        return ctx.handler.handle(record).await;
    }

    let renew_interval = options.heartbeat.renew_interval();
    let mut renew = tokio::time::interval_at(Instant::now() + renew_interval, renew_interval);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let handling = ctx.handler.handle(record);
    tokio::pin!(handling);
    loop {
        tokio::select! {
            outcome = &mut handling => return outcome,
            _ = renew.tick() => {
                match ctx.engine.send_heartbeat(record.queue_id).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        warn!(worker_id, queue_id = %record.queue_id, "lease lost while handling");
                    }
                    Err(e) => {
                        error!(worker_id, queue_id = %record.queue_id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }
}

async fn process(worker_id: usize, ctx: &WorkerContext, record: MessageRecord) {
    let queue_id = record.queue_id;
    let outcome = handle_with_heartbeat(worker_id, ctx, &record).await;

    let reported = match outcome {
        Ok(()) => ctx.engine.complete(queue_id).await,
        Err(HandlerError::Poison(reason)) => {
            warn!(worker_id, %queue_id, %reason, "poison message");
            ctx.engine.quarantine_poison(queue_id, &reason).await
        }
        Err(HandlerError::Failed {
            exception_type,
            message,
        }) => {
            // 判断は lease 時点のカウントで行う
            let current = record.retry_count(&exception_type);
            if ctx.retry.should_retry(&exception_type, current) {
                retry_later(ctx, &record, &exception_type).await
            } else {
                let exception = format!("{exception_type}: {message}");
                ctx.engine.move_to_error_queue(queue_id, &exception).await
            }
        }
    };

    match reported {
        Ok(()) => {}
        Err(QueueError::NotFound(_)) => {
            // heartbeat monitor か他のワーカーが先に処理した
            warn!(worker_id, %queue_id, "message vanished before outcome was recorded");
        }
        Err(e) => error!(worker_id, %queue_id, error = %e, "failed to record outcome"),
    }
}

async fn retry_later(
    ctx: &WorkerContext,
    record: &MessageRecord,
    exception_type: &str,
) -> Result<(), QueueError> {
    let count = ctx.engine.record_error(record.queue_id, exception_type).await?;
    let delay = ctx.retry.next_delay(count);
    let backoff = Some(delay).filter(|d| !d.is_zero());
    debug!(queue_id = %record.queue_id, exception_type, count, ?backoff, "retrying");
    ctx.engine.rollback(record.queue_id, backoff).await
}
