//! leaseq-core
//!
//! Transactional work queue with leases, retries, delayed delivery and
//! expiration over pluggable stores.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message record, columns, events, status）
//! - **ports**: 抽象化レイヤー（StoreAdapter, Clock, RetryPolicy, Serializer, EventSink）
//! - **impls**: StoreAdapter の実装（memory, sqlite, redis）
//! - **engine**: ライフサイクルエンジン（状態遷移の唯一の入口）
//! - **monitor**: heartbeat / delayed / expiration の各バックグラウンドループ
//! - **worker**: ワーカープール（lease → handler → complete / rollback / error）
//! - **typed**: 型付き API（Payload, Handler<T>, Producer<T>）
//! - **queue**: すべてを束ねる Queue と QueueBuilder
//! - **config / error / telemetry**: 設定、エラー型、tracing の初期化

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod impls;
pub mod monitor;
pub mod ports;
pub mod queue;
pub mod telemetry;
pub mod typed;
pub mod worker;

pub use config::{LeaseqConfig, QueueOptions, StoreConfig};
pub use domain::{CorrelationId, EnqueueOptions, MessageRecord, MessageStatus, QueueId};
pub use engine::LifecycleEngine;
pub use error::{QueueError, Result};
pub use queue::{Queue, QueueBuilder, QueueCreationResult, QueueCreationStatus};
pub use worker::{HandlerError, MessageHandler, WorkerGroup};
