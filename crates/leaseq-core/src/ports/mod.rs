//! Ports - 抽象化レイヤー
//!
//! エンジンが外部に依存する箇所を trait として切り出す。
//! 実装は `impls`（ストア）と各 port モジュール内の既定実装にある。

pub mod clock;
pub mod event_sink;
pub mod retry;
pub mod serializer;
pub mod store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::event_sink::{EventSink, MemoryEventSink, NoopEventSink, TracingEventSink};
pub use self::retry::{ExponentialRetryPolicy, RetryPolicy};
pub use self::serializer::{JsonSerializer, Serializer};
pub use self::store::{DequeueRequest, PurgeFilter, StoreAdapter};
