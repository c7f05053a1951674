//! Impls - StoreAdapter の実装
//!
//! # 含まれる実装
//! - **InMemoryStore**: テスト・開発用（プロセス内のみ）
//! - **SqliteStore**: feature `sqlite`（既定で有効）
//! - **RedisStore**: feature `redis`
//!
//! `open_store` は `StoreConfig` から適切な実装を組み立てる。

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub(crate) mod sql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use crate::config::{QueueOptions, StoreConfig};
use crate::error::Result;
use crate::ports::StoreAdapter;

// 主要な型を再エクスポート
pub use self::memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteStore;

/// Build the backend named by `config` for the queue described by `options`.
pub async fn open_store(
    config: &StoreConfig,
    options: &QueueOptions,
) -> Result<Arc<dyn StoreAdapter>> {
    options.validate()?;
    match config {
        StoreConfig::Memory => Ok(Arc::new(InMemoryStore::new(options))),
        StoreConfig::Sqlite {
            path,
            max_connections,
            busy_timeout_ms,
        } => open_sqlite(path.as_deref(), *max_connections, *busy_timeout_ms, options).await,
        StoreConfig::Redis { url, namespace } => open_redis(url, namespace, options).await,
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(
    path: Option<&str>,
    max_connections: u32,
    busy_timeout_ms: u64,
    options: &QueueOptions,
) -> Result<Arc<dyn StoreAdapter>> {
    use std::time::Duration;

    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};

    let store = match path {
        None => SqliteStore::in_memory(options).await?,
        Some(path) => {
            let connect = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            SqliteStore::connect_with(
                connect,
                max_connections.max(1),
                Duration::from_millis(busy_timeout_ms),
                options,
            )
            .await?
        }
    };
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(
    _path: Option<&str>,
    _max_connections: u32,
    _busy_timeout_ms: u64,
    _options: &QueueOptions,
) -> Result<Arc<dyn StoreAdapter>> {
    Err(crate::error::QueueError::configuration(
        "sqlite backend requested but the `sqlite` feature is disabled",
    ))
}

#[cfg(feature = "redis")]
async fn open_redis(
    url: &str,
    namespace: &str,
    options: &QueueOptions,
) -> Result<Arc<dyn StoreAdapter>> {
    Ok(Arc::new(RedisStore::connect(url, namespace, options).await?))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(
    _url: &str,
    _namespace: &str,
    _options: &QueueOptions,
) -> Result<Arc<dyn StoreAdapter>> {
    Err(crate::error::QueueError::configuration(
        "redis backend requested but the `redis` feature is disabled",
    ))
}
