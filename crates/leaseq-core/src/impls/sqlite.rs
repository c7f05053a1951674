//! SQLite store on `sqlx`.
//!
//! Every write runs in one transaction whose first statement is a write,
//! so WAL readers never have to upgrade a stale snapshot. Dequeue picks a
//! candidate with a plain read, then claims it with `UPDATE ... WHERE
//! queue_id = $2 AND heartbeat IS NULL RETURNING queue_id`. A claim that
//! matches nothing lost the race to another worker and reports
//! `LeaseConflict`.
//! Timestamps are stored as integer milliseconds.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use super::sql::{SqlCommands, column_name};
use crate::config::QueueOptions;
use crate::domain::{
    AdditionalColumns, ColumnSchema, ColumnType, ColumnValue, CorrelationId, ErrorTrackingRecord,
    MessageRecord, MessageStatus, MetaDataErrorsRecord, NewMessage, QueueCounts, QueueId,
    StatusRecord, from_millis, to_millis,
};
use crate::error::{QueueError, Result};
use crate::ports::store::{DequeueRequest, PurgeFilter, StoreAdapter};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn write_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> QueueError {
    move |e| QueueError::store_write(operation, e)
}

fn read_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> QueueError {
    move |e| QueueError::store_read(operation, e)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub struct SqliteStore {
    pool: SqlitePool,
    commands: SqlCommands,
    options: QueueOptions,
}

impl SqliteStore {
    /// Open (or create) a database file with WAL journaling.
    pub async fn open(path: impl AsRef<Path>, options: &QueueOptions) -> Result<Self> {
        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::connect_with(connect, 5, DEFAULT_BUSY_TIMEOUT, options).await
    }

    /// Private in-memory database. A single pooled connection keeps it alive.
    pub async fn in_memory(options: &QueueOptions) -> Result<Self> {
        options.validate()?;
        let connect = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect)
            .await
            .map_err(write_err("connect"))?;
        Self::from_pool(pool, options)
    }

    pub async fn connect_with(
        connect: SqliteConnectOptions,
        max_connections: u32,
        busy_timeout: Duration,
        options: &QueueOptions,
    ) -> Result<Self> {
        options.validate()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect.busy_timeout(busy_timeout))
            .await
            .map_err(write_err("connect"))?;
        Self::from_pool(pool, options)
    }

    pub fn from_pool(pool: SqlitePool, options: &QueueOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            pool,
            commands: SqlCommands::new(options),
            options: options.clone(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Options written to the configuration table at creation.
    pub async fn stored_options(&self) -> Result<Option<QueueOptions>> {
        let raw: Option<String> = sqlx::query_scalar(&self.commands.select_configuration)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("stored options"))?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| QueueError::Serialization(format!("stored options: {e}")))
        })
        .transpose()
    }
}

fn bind_column<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    column_type: ColumnType,
    value: Option<&ColumnValue>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match (column_type, value) {
        (_, Some(ColumnValue::Integer(v))) => query.bind(*v),
        (_, Some(ColumnValue::Text(v))) => query.bind(v.clone()),
        (_, Some(ColumnValue::Boolean(v))) => query.bind(*v),
        (_, Some(ColumnValue::Real(v))) => query.bind(*v),
        (ColumnType::Integer, None) => query.bind(None::<i64>),
        (ColumnType::Text, None) => query.bind(None::<String>),
        (ColumnType::Boolean, None) => query.bind(None::<bool>),
        (ColumnType::Real, None) => query.bind(None::<f64>),
    }
}

fn decode_err(e: sqlx::Error) -> QueueError {
    QueueError::store_read("decode row", e)
}

fn read_columns(row: &SqliteRow, schema: &ColumnSchema) -> Result<AdditionalColumns> {
    let mut columns = AdditionalColumns::new();
    for definition in schema.iter() {
        let name = column_name(&definition.name);
        let value = match definition.column_type {
            ColumnType::Integer => row
                .try_get::<Option<i64>, _>(name.as_str())
                .map_err(decode_err)?
                .map(ColumnValue::Integer),
            ColumnType::Text => row
                .try_get::<Option<String>, _>(name.as_str())
                .map_err(decode_err)?
                .map(ColumnValue::Text),
            ColumnType::Boolean => row
                .try_get::<Option<bool>, _>(name.as_str())
                .map_err(decode_err)?
                .map(ColumnValue::Boolean),
            ColumnType::Real => row
                .try_get::<Option<f64>, _>(name.as_str())
                .map_err(decode_err)?
                .map(ColumnValue::Real),
        };
        if let Some(value) = value {
            columns.set(definition.name.clone(), value);
        }
    }
    Ok(columns)
}

fn read_correlation_id(row: &SqliteRow) -> Result<CorrelationId> {
    let raw: String = row.try_get("correlation_id").map_err(decode_err)?;
    raw.parse()
        .map_err(|e| QueueError::store_read("decode correlation id", e))
}

fn read_priority(row: &SqliteRow) -> Result<Option<u8>> {
    let raw: Option<i64> = row.try_get("priority").map_err(decode_err)?;
    Ok(raw.and_then(|p| u8::try_from(p).ok()))
}

fn read_status(row: &SqliteRow) -> Result<MessageStatus> {
    let raw: i64 = row.try_get("status").map_err(decode_err)?;
    MessageStatus::from_i64(raw)
        .ok_or_else(|| QueueError::store_read("decode status", format!("unknown status {raw}")))
}

fn read_millis(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: i64 = row.try_get(column).map_err(decode_err)?;
    Ok(from_millis(raw))
}

fn read_optional_millis(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<i64> = row.try_get(column).map_err(decode_err)?;
    Ok(raw.map(from_millis))
}

/// Record and error counts of a freshly leased row.
fn leased_from_rows(
    row: &SqliteRow,
    tracking: &[SqliteRow],
    schema: &ColumnSchema,
) -> Result<MessageRecord> {
    let body: Vec<u8> = row.try_get("body").map_err(decode_err)?;
    let headers: Vec<u8> = row.try_get("headers").map_err(decode_err)?;
    let mut record = record_from_row(row, schema, body, headers)?;
    record.error_counts = tracking
        .iter()
        .map(|row| tracking_from_row(record.queue_id, row))
        .collect::<Result<_>>()?;
    Ok(record)
}

/// Build a record from a metadata row; body and headers come from the queue table.
fn record_from_row(
    row: &SqliteRow,
    schema: &ColumnSchema,
    body: Vec<u8>,
    headers: Vec<u8>,
) -> Result<MessageRecord> {
    let queue_id: i64 = row.try_get("queue_id").map_err(decode_err)?;
    let delivery_count: i64 = row.try_get("delivery_count").map_err(decode_err)?;
    Ok(MessageRecord {
        queue_id: QueueId::new(queue_id),
        correlation_id: read_correlation_id(row)?,
        body,
        headers,
        status: read_status(row)?,
        queued_at: read_millis(row, "queued_at")?,
        process_at: read_millis(row, "process_at")?,
        heartbeat: read_optional_millis(row, "heartbeat")?,
        expires_at: read_optional_millis(row, "expires_at")?,
        route: row.try_get("route").map_err(decode_err)?,
        priority: read_priority(row)?,
        job_name: row.try_get("job_name").map_err(decode_err)?,
        columns: read_columns(row, schema)?,
        delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
        error_counts: Vec::new(),
    })
}

fn error_from_row(row: &SqliteRow) -> Result<MetaDataErrorsRecord> {
    let queue_id: i64 = row.try_get("queue_id").map_err(decode_err)?;
    let delivery_count: i64 = row.try_get("delivery_count").map_err(decode_err)?;
    let columns_json: String = row.try_get("columns").map_err(decode_err)?;
    let columns = serde_json::from_str(&columns_json)
        .map_err(|e| QueueError::Serialization(format!("error columns: {e}")))?;
    Ok(MetaDataErrorsRecord {
        queue_id: QueueId::new(queue_id),
        correlation_id: read_correlation_id(row)?,
        body: row.try_get("body").map_err(decode_err)?,
        headers: row.try_get("headers").map_err(decode_err)?,
        queued_at: read_millis(row, "queued_at")?,
        process_at: read_millis(row, "process_at")?,
        expires_at: read_optional_millis(row, "expires_at")?,
        route: row.try_get("route").map_err(decode_err)?,
        priority: read_priority(row)?,
        job_name: row.try_get("job_name").map_err(decode_err)?,
        columns,
        delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
        last_exception: row.try_get("last_exception").map_err(decode_err)?,
        last_exception_at: read_millis(row, "last_exception_at")?,
    })
}

fn tracking_from_row(queue_id: QueueId, row: &SqliteRow) -> Result<ErrorTrackingRecord> {
    let retry_count: i64 = row.try_get("retry_count").map_err(decode_err)?;
    Ok(ErrorTrackingRecord {
        queue_id,
        exception_type: row.try_get("exception_type").map_err(decode_err)?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
    })
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn create(&self) -> Result<bool> {
        let existed = self.exists().await?;
        let options_json = serde_json::to_string(&self.options)
            .map_err(|e| QueueError::Serialization(format!("queue options: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(write_err("create"))?;
        for statement in &self.commands.create_tables {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(write_err("create"))?;
        }
        sqlx::query(&self.commands.insert_configuration)
            .bind(options_json)
            .bind(to_millis(Utc::now()))
            .execute(&mut *tx)
            .await
            .map_err(write_err("create"))?;
        tx.commit().await.map_err(write_err("create"))?;

        if !existed {
            info!(queue = %self.options.name, "created sqlite queue tables");
        }
        Ok(!existed)
    }

    async fn exists(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(&self.commands.table_exists)
            .bind(self.commands.tables.configuration.clone())
            .fetch_one(&self.pool)
            .await
            .map_err(read_err("exists"))?;
        Ok(count > 0)
    }

    async fn remove(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(write_err("remove"))?;
        for table in self.commands.tables.all() {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&mut *tx)
                .await
                .map_err(write_err("remove"))?;
        }
        tx.commit().await.map_err(write_err("remove"))?;
        info!(queue = %self.options.name, "removed sqlite queue tables");
        Ok(())
    }

    async fn enqueue(&self, message: NewMessage) -> Result<QueueId> {
        let NewMessage {
            correlation_id,
            body,
            headers,
            queued_at,
            process_at,
            expires_at,
            route,
            priority,
            job_name,
            columns,
        } = message;

        let mut tx = self.pool.begin().await.map_err(write_err("enqueue"))?;
        let queue_id: i64 = sqlx::query_scalar(&self.commands.insert_body)
            .bind(body)
            .bind(headers)
            .fetch_one(&mut *tx)
            .await
            .map_err(write_err("enqueue"))?;

        let mut insert = sqlx::query(&self.commands.insert_metadata)
            .bind(queue_id)
            .bind(correlation_id.to_string())
            .bind(to_millis(queued_at))
            .bind(to_millis(process_at))
            .bind(expires_at.map(to_millis))
            .bind(route)
            .bind(priority.map(i64::from))
            .bind(job_name.clone());
        for definition in self.options.additional_columns.iter() {
            insert = bind_column(insert, definition.column_type, columns.get(&definition.name));
        }
        insert
            .execute(&mut *tx)
            .await
            .map_err(write_err("enqueue"))?;

        if self.options.enable_status_table {
            sqlx::query(&self.commands.insert_status)
                .bind(queue_id)
                .bind(correlation_id.to_string())
                .bind(MessageStatus::Waiting.as_i64())
                .bind(job_name)
                .execute(&mut *tx)
                .await
                .map_err(write_err("enqueue"))?;
        }
        tx.commit().await.map_err(write_err("enqueue"))?;
        Ok(QueueId::new(queue_id))
    }

    async fn dequeue(&self, request: &DequeueRequest) -> Result<Option<MessageRecord>> {
        let now = to_millis(request.now);
        let candidate: Option<i64> = match &request.route {
            Some(route) => sqlx::query_scalar(&self.commands.select_candidate_by_route)
                .bind(now)
                .bind(route.clone())
                .fetch_optional(&self.pool)
                .await
                .map_err(read_err("dequeue"))?,
            None => sqlx::query_scalar(&self.commands.select_candidate)
                .bind(now)
                .fetch_optional(&self.pool)
                .await
                .map_err(read_err("dequeue"))?,
        };
        let Some(queue_id) = candidate else {
            return Ok(None);
        };

        let mut tx = self.pool.begin().await.map_err(write_err("dequeue"))?;
        let claimed: Option<i64> = sqlx::query_scalar(&self.commands.claim)
            .bind(now)
            .bind(queue_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(write_err("dequeue"))?;
        if claimed.is_none() {
            return Err(QueueError::LeaseConflict(QueueId::new(queue_id)));
        }

        let row = sqlx::query(&self.commands.select_leased)
            .bind(queue_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(read_err("dequeue"))?;
        let tracking = sqlx::query(&self.commands.select_tracking)
            .bind(queue_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(read_err("dequeue"))?;
        if self.options.enable_status_table {
            sqlx::query(&self.commands.update_status)
                .bind(queue_id)
                .bind(MessageStatus::Processing.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(write_err("dequeue"))?;
        }

        let decoded = leased_from_rows(&row, &tracking, &self.options.additional_columns);
        tx.commit().await.map_err(write_err("dequeue"))?;
        // The lease is committed either way; an undecodable row is poison.
        decoded.map(Some).map_err(|e| QueueError::Poison {
            queue_id: QueueId::new(queue_id),
            reason: e.to_string(),
        })
    }

    async fn complete(&self, queue_id: QueueId) -> Result<()> {
        let id = queue_id.as_i64();
        let mut tx = self.pool.begin().await.map_err(write_err("complete"))?;
        let deleted: Option<i64> = sqlx::query_scalar(&self.commands.complete)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(write_err("complete"))?;
        if deleted.is_none() {
            return Err(QueueError::NotFound(queue_id));
        }
        for statement in [&self.commands.delete_body, &self.commands.delete_tracking] {
            sqlx::query(statement)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(write_err("complete"))?;
        }
        if self.options.enable_status_table {
            sqlx::query(&self.commands.delete_status)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(write_err("complete"))?;
        }
        tx.commit().await.map_err(write_err("complete"))?;
        Ok(())
    }

    async fn rollback(&self, queue_id: QueueId, process_at: Option<DateTime<Utc>>) -> Result<()> {
        let id = queue_id.as_i64();
        let mut tx = self.pool.begin().await.map_err(write_err("rollback"))?;
        let result = sqlx::query(&self.commands.rollback)
            .bind(id)
            .bind(process_at.map(to_millis))
            .execute(&mut *tx)
            .await
            .map_err(write_err("rollback"))?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(queue_id));
        }
        if self.options.enable_status_table {
            sqlx::query(&self.commands.update_status)
                .bind(id)
                .bind(MessageStatus::Waiting.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(write_err("rollback"))?;
        }
        tx.commit().await.map_err(write_err("rollback"))?;
        Ok(())
    }

    async fn send_heartbeat(&self, queue_id: QueueId, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(&self.commands.heartbeat)
            .bind(queue_id.as_i64())
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .map_err(write_err("send heartbeat"))?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(queue_id));
        }
        Ok(())
    }

    async fn reset_expired_heartbeats(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueId>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(write_err("reset heartbeats"))?;
        let mut ids: Vec<i64> = sqlx::query_scalar(&self.commands.reset_heartbeats)
            .bind(to_millis(cutoff))
            .bind(limit_param(limit))
            .fetch_all(&mut *tx)
            .await
            .map_err(write_err("reset heartbeats"))?;
        ids.sort_unstable();
        if self.options.enable_status_table {
            for id in &ids {
                sqlx::query(&self.commands.update_status)
                    .bind(*id)
                    .bind(MessageStatus::Waiting.as_i64())
                    .execute(&mut *tx)
                    .await
                    .map_err(write_err("reset heartbeats"))?;
            }
        }
        tx.commit().await.map_err(write_err("reset heartbeats"))?;
        Ok(ids.into_iter().map(QueueId::new).collect())
    }

    async fn record_error(&self, queue_id: QueueId, exception_type: &str) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(&self.commands.record_error)
            .bind(queue_id.as_i64())
            .bind(exception_type.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(write_err("record error"))?;
        let count = count.ok_or(QueueError::NotFound(queue_id))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn move_to_error_queue(
        &self,
        queue_id: QueueId,
        exception: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = queue_id.as_i64();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(write_err("move to error queue"))?;
        let Some(meta) = sqlx::query(&self.commands.take_metadata)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(write_err("move to error queue"))?
        else {
            return Err(QueueError::NotFound(queue_id));
        };
        let payload = sqlx::query(&self.commands.take_body)
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(write_err("move to error queue"))?;
        let body: Vec<u8> = payload.try_get("body").map_err(decode_err)?;
        let headers: Vec<u8> = payload.try_get("headers").map_err(decode_err)?;

        let record = record_from_row(&meta, &self.options.additional_columns, body, headers)?;
        let error = record.into_error_record(exception, now);
        let columns_json = serde_json::to_string(&error.columns)
            .map_err(|e| QueueError::Serialization(format!("error columns: {e}")))?;

        sqlx::query(&self.commands.insert_error)
            .bind(id)
            .bind(error.correlation_id.to_string())
            .bind(error.body)
            .bind(error.headers)
            .bind(to_millis(error.queued_at))
            .bind(to_millis(error.process_at))
            .bind(error.expires_at.map(to_millis))
            .bind(error.route)
            .bind(error.priority.map(i64::from))
            .bind(error.job_name)
            .bind(i64::from(error.delivery_count))
            .bind(columns_json)
            .bind(error.last_exception)
            .bind(to_millis(error.last_exception_at))
            .execute(&mut *tx)
            .await
            .map_err(write_err("move to error queue"))?;

        if self.options.enable_status_table {
            sqlx::query(&self.commands.update_status)
                .bind(id)
                .bind(MessageStatus::Error.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(write_err("move to error queue"))?;
        }
        tx.commit()
            .await
            .map_err(write_err("move to error queue"))?;
        Ok(())
    }

    async fn promote_delayed(&self, _now: DateTime<Utc>, _limit: usize) -> Result<u64> {
        // Dequeue filters on process_at; nothing to move.
        Ok(0)
    }

    async fn remove_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueId>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(write_err("remove expired"))?;
        let mut ids: Vec<i64> = sqlx::query_scalar(&self.commands.remove_expired)
            .bind(to_millis(now))
            .bind(limit_param(limit))
            .fetch_all(&mut *tx)
            .await
            .map_err(write_err("remove expired"))?;
        ids.sort_unstable();

        for id in &ids {
            for statement in [&self.commands.delete_body, &self.commands.delete_tracking] {
                sqlx::query(statement)
                    .bind(*id)
                    .execute(&mut *tx)
                    .await
                    .map_err(write_err("remove expired"))?;
            }
            if self.options.enable_status_table {
                sqlx::query(&self.commands.delete_status)
                    .bind(*id)
                    .execute(&mut *tx)
                    .await
                    .map_err(write_err("remove expired"))?;
            }
        }
        tx.commit().await.map_err(write_err("remove expired"))?;
        if !ids.is_empty() {
            debug!(queue = %self.options.name, count = ids.len(), "removed expired messages");
        }
        Ok(ids.into_iter().map(QueueId::new).collect())
    }

    async fn purge_error_messages(&self, filter: PurgeFilter) -> Result<u64> {
        let cutoff = match filter {
            PurgeFilter::All => None,
            PurgeFilter::OlderThan(at) => Some(to_millis(at)),
        };
        let mut tx = self.pool.begin().await.map_err(write_err("purge errors"))?;
        let ids: Vec<i64> = sqlx::query_scalar(&self.commands.purge_errors)
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .map_err(write_err("purge errors"))?;
        for id in &ids {
            sqlx::query(&self.commands.delete_tracking)
                .bind(*id)
                .execute(&mut *tx)
                .await
                .map_err(write_err("purge errors"))?;
            if self.options.enable_status_table {
                sqlx::query(&self.commands.delete_status)
                    .bind(*id)
                    .execute(&mut *tx)
                    .await
                    .map_err(write_err("purge errors"))?;
            }
        }
        tx.commit().await.map_err(write_err("purge errors"))?;
        Ok(ids.len() as u64)
    }

    async fn status(&self, correlation_id: CorrelationId) -> Result<Option<StatusRecord>> {
        if !self.options.enable_status_table {
            return Ok(None);
        }
        let row = sqlx::query(&self.commands.select_status)
            .bind(correlation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("status"))?;
        row.map(|row| {
            let queue_id: i64 = row.try_get("queue_id").map_err(decode_err)?;
            Ok(StatusRecord {
                queue_id: QueueId::new(queue_id),
                correlation_id,
                status: read_status(&row)?,
                job_name: row.try_get("job_name").map_err(decode_err)?,
            })
        })
        .transpose()
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts> {
        let row = sqlx::query(&self.commands.counts)
            .bind(to_millis(now))
            .fetch_one(&self.pool)
            .await
            .map_err(read_err("counts"))?;
        let errors: i64 = sqlx::query_scalar(&self.commands.count_errors)
            .fetch_one(&self.pool)
            .await
            .map_err(read_err("counts"))?;
        let get = |column: &str| -> Result<u64> {
            let value: i64 = row.try_get(column).map_err(decode_err)?;
            Ok(u64::try_from(value).unwrap_or(0))
        };
        Ok(QueueCounts {
            waiting: get("waiting")?,
            processing: get("processing")?,
            delayed: get("delayed")?,
            error: u64::try_from(errors).unwrap_or(0),
        })
    }

    async fn error_messages(&self, limit: usize) -> Result<Vec<MetaDataErrorsRecord>> {
        let rows = sqlx::query(&self.commands.select_errors)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("error messages"))?;
        rows.iter().map(error_from_row).collect()
    }

    async fn error_tracking(&self, queue_id: QueueId) -> Result<Vec<ErrorTrackingRecord>> {
        let rows = sqlx::query(&self.commands.select_tracking)
            .bind(queue_id.as_i64())
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("error tracking"))?;
        rows.iter().map(|row| tracking_from_row(queue_id, row)).collect()
    }
}
