use std::error::Error;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};
use tracing::info;

use leaseq_core::config::LeaseqConfig;
use leaseq_core::telemetry::{LogFormat, init_tracing};
use leaseq_core::typed::{Handler, MessageContext, Payload};
use leaseq_core::{HandlerError, Queue, QueueBuilder, QueueCreationStatus, QueueOptions};

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    name: String,
}

impl Payload for Greeting {
    const TYPE: &'static str = "demo.greeting.v1";
}

/// 指定回数だけ失敗してから成功する handler
struct Greeter {
    remaining_failures: AtomicU32,
}

impl Greeter {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Handler<Greeting> for Greeter {
    async fn handle(&self, payload: Greeting, ctx: &MessageContext) -> Result<(), HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::failed(
                "FlakyGreeting",
                format!("intentional failure (left={left})"),
            ));
        }

        println!(
            "Hello, {}! (queue_id={}, delivery={})",
            payload.name, ctx.queue_id, ctx.delivery_count
        );
        Ok(())
    }
}

/// 引数に TOML のパスがあれば読む。なければ in-memory store
async fn build_queue() -> Result<Queue, Box<dyn Error>> {
    let builder = match std::env::args().nth(1) {
        Some(path) => QueueBuilder::from_config(LeaseqConfig::from_toml_file(path)?),
        None => {
            let mut options = QueueOptions::new("greetings");
            options.retry.base_delay_ms = 100;
            options.worker.workers = 2;
            QueueBuilder::new(options)
        }
    };
    Ok(builder.build().await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let format = std::env::var("LEASEQ_LOG_FORMAT")
        .ok()
        .and_then(|raw| raw.parse::<LogFormat>().ok())
        .unwrap_or(LogFormat::Compact);
    init_tracing(format)?;

    // (A) キューを作成してモニターを起動
    let mut queue = build_queue().await?;
    let created = queue.create().await;
    if !matches!(
        created.status,
        QueueCreationStatus::Success | QueueCreationStatus::AlreadyExists
    ) {
        return Err(created.message.into());
    }
    queue.start_monitors();

    // (B) ワーカーを起動
    let workers = queue.consume::<Greeting, _>(Greeter::new(2));

    // (C) 投入
    let producer = queue.producer::<Greeting>();
    for name in ["leaseq", "tokio", "sqlite"] {
        let sent = producer.send(&Greeting { name: name.into() }).await?;
        info!(queue_id = %sent.queue_id, correlation_id = %sent.correlation_id, "enqueued");
    }

    // (D) live table が空になるまで待つ
    loop {
        let counts = queue.engine().counts().await?;
        if counts.live() == 0 {
            println!("final counts: {counts:?}");
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    // (E) ワーカー、モニターの順に止める
    workers.shutdown_and_join().await;
    queue.shutdown().await;
    Ok(())
}
