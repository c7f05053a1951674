//! Redis store.
//!
//! Every state transition is one Lua script, so it runs atomically on the
//! server. Scripts receive only the key prefix and derive every other key
//! from it, so the backend targets a standalone Redis server; Cluster is not
//! supported. Keys live under one prefix:
//!
//! - `<p>:id` id counter
//! - `<p>:msg:<id>` message hash
//! - `<p>:ready`, `<p>:ready:<route>` dequeue order (priority, then id)
//! - `<p>:delayed` due time, `<p>:working` heartbeat
//! - `<p>:expiry` expiration of unleased messages
//! - `<p>:tracking:<id>` exception type -> retry count
//! - `<p>:error:<id>`, `<p>:errors` (by id), `<p>:errors_at` (by exception time)
//! - `<p>:status:<id>` status row, `<p>:cid:<correlation id>` ids sharing it
//! - `<p>:config`
//!
//! Delayed messages sit in the `delayed` sorted set until promoted, either by
//! the delayed-processing monitor or by the next dequeue.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::config::QueueOptions;
use crate::domain::{
    AdditionalColumns, CorrelationId, ErrorTrackingRecord, MessageRecord, MessageStatus,
    MetaDataErrorsRecord, NewMessage, QueueCounts, QueueId, StatusRecord, from_millis, to_millis,
};
use crate::error::{QueueError, Result};
use crate::ports::store::{DequeueRequest, PurgeFilter, StoreAdapter};

/// Due delayed messages promoted inline by each dequeue.
const INLINE_PROMOTE_LIMIT: usize = 100;

const HELPERS: &str = r#"
local function ready_score(rank, id)
  return string.format('%.0f', (256 - rank) * 1099511627776 + tonumber(id))
end

local function make_ready(p, id)
  local key = p .. ':msg:' .. id
  local rank = tonumber(redis.call('HGET', key, 'rank') or '0')
  local score = ready_score(rank, id)
  redis.call('ZADD', p .. ':ready', score, id)
  local route = redis.call('HGET', key, 'route')
  if route and route ~= '' then
    redis.call('ZADD', p .. ':ready:' .. route, score, id)
  end
end

local function unready(p, id, route)
  redis.call('ZREM', p .. ':ready', id)
  if route and route ~= '' then
    redis.call('ZREM', p .. ':ready:' .. route, id)
  end
end

local function track_expiry(p, id)
  local expires = redis.call('HGET', p .. ':msg:' .. id, 'expires_at')
  if expires and expires ~= '' then
    redis.call('ZADD', p .. ':expiry', expires, id)
  end
end

local function drop_indexes(p, id, route)
  unready(p, id, route)
  redis.call('ZREM', p .. ':delayed', id)
  redis.call('ZREM', p .. ':working', id)
  redis.call('ZREM', p .. ':expiry', id)
end

local function set_status(p, enabled, id, status)
  if enabled == '1' and redis.call('EXISTS', p .. ':status:' .. id) == 1 then
    redis.call('HSET', p .. ':status:' .. id, 'status', status)
  end
end

local function drop_status(p, enabled, id, cid)
  if enabled == '1' then
    redis.call('DEL', p .. ':status:' .. id)
    if cid then
      redis.call('ZREM', p .. ':cid:' .. cid, id)
    end
  end
end

local function promote(p, now, limit)
  local due = redis.call('ZRANGEBYSCORE', p .. ':delayed', '-inf', now, 'LIMIT', 0, limit)
  for _, id in ipairs(due) do
    redis.call('ZREM', p .. ':delayed', id)
    if redis.call('EXISTS', p .. ':msg:' .. id) == 1 then
      make_ready(p, id)
    end
  end
  return #due
end
"#;

const ENQUEUE: &str = r#"
local p = KEYS[1]
local id = redis.call('INCR', p .. ':id')
local key = p .. ':msg:' .. id
redis.call('HSET', key,
  'body', ARGV[1], 'headers', ARGV[2], 'correlation_id', ARGV[3], 'status', '0',
  'queued_at', ARGV[4], 'process_at', ARGV[5], 'expires_at', ARGV[6], 'route', ARGV[7],
  'priority', ARGV[8], 'job_name', ARGV[9], 'columns', ARGV[10], 'rank', ARGV[11],
  'delivery_count', '0')
if tonumber(ARGV[5]) > tonumber(ARGV[4]) then
  redis.call('ZADD', p .. ':delayed', ARGV[5], id)
else
  make_ready(p, id)
end
track_expiry(p, id)
if ARGV[12] == '1' then
  redis.call('HSET', p .. ':status:' .. id,
    'queue_id', id, 'correlation_id', ARGV[3], 'status', '0', 'job_name', ARGV[9])
  redis.call('ZADD', p .. ':cid:' .. ARGV[3], id, id)
end
return id
"#;

// Replies `{id, message fields, tracking fields}` so the lease and the
// record it hands out are one atomic step.
const DEQUEUE: &str = r#"
local p = KEYS[1]
local now = tonumber(ARGV[1])
promote(p, ARGV[1], tonumber(ARGV[4]))
local set = p .. ':ready'
if ARGV[2] ~= '' then
  set = p .. ':ready:' .. ARGV[2]
end
for _ = 1, 100 do
  local head = redis.call('ZRANGE', set, 0, 0)
  if #head == 0 then
    return false
  end
  local id = head[1]
  local key = p .. ':msg:' .. id
  local expires = redis.call('HGET', key, 'expires_at')
  local route = redis.call('HGET', key, 'route')
  if not expires then
    redis.call('ZREM', set, id)
    redis.call('ZREM', p .. ':ready', id)
  elseif expires ~= '' and tonumber(expires) <= now then
    unready(p, id, route)
  else
    unready(p, id, route)
    redis.call('ZREM', p .. ':expiry', id)
    redis.call('HSET', key, 'status', '1', 'heartbeat', ARGV[1])
    redis.call('HINCRBY', key, 'delivery_count', 1)
    redis.call('ZADD', p .. ':working', ARGV[1], id)
    set_status(p, ARGV[3], id, '1')
    return {
      tonumber(id),
      redis.call('HGETALL', key),
      redis.call('HGETALL', p .. ':tracking:' .. id),
    }
  end
end
return false
"#;

const COMPLETE: &str = r#"
local p = KEYS[1]
local id = ARGV[1]
local key = p .. ':msg:' .. id
if redis.call('EXISTS', key) == 0 then
  return 0
end
local cid = redis.call('HGET', key, 'correlation_id')
drop_indexes(p, id, redis.call('HGET', key, 'route'))
redis.call('DEL', key, p .. ':tracking:' .. id)
drop_status(p, ARGV[2], id, cid)
return 1
"#;

const ROLLBACK: &str = r#"
local p = KEYS[1]
local id = ARGV[1]
local key = p .. ':msg:' .. id
if redis.call('EXISTS', key) == 0 then
  return 0
end
drop_indexes(p, id, redis.call('HGET', key, 'route'))
track_expiry(p, id)
redis.call('HSET', key, 'status', '0')
redis.call('HDEL', key, 'heartbeat')
if ARGV[2] ~= '' then
  redis.call('HSET', key, 'process_at', ARGV[2])
  redis.call('ZADD', p .. ':delayed', ARGV[2], id)
else
  make_ready(p, id)
end
set_status(p, ARGV[3], id, '0')
return 1
"#;

const HEARTBEAT: &str = r#"
local p = KEYS[1]
if not redis.call('ZSCORE', p .. ':working', ARGV[1]) then
  return 0
end
redis.call('HSET', p .. ':msg:' .. ARGV[1], 'heartbeat', ARGV[2])
redis.call('ZADD', p .. ':working', ARGV[2], ARGV[1])
return 1
"#;

const RESET_HEARTBEATS: &str = r#"
local p = KEYS[1]
local stale = redis.call('ZRANGEBYSCORE', p .. ':working', '-inf', '(' .. ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local reset = {}
for _, id in ipairs(stale) do
  local key = p .. ':msg:' .. id
  redis.call('ZREM', p .. ':working', id)
  if redis.call('HGET', key, 'status') == '1' then
    redis.call('HSET', key, 'status', '0')
    redis.call('HDEL', key, 'heartbeat')
    make_ready(p, id)
    track_expiry(p, id)
    set_status(p, ARGV[3], id, '0')
    table.insert(reset, tonumber(id))
  end
end
return reset
"#;

const RECORD_ERROR: &str = r#"
local p = KEYS[1]
if redis.call('EXISTS', p .. ':msg:' .. ARGV[1]) == 0 then
  return false
end
return redis.call('HINCRBY', p .. ':tracking:' .. ARGV[1], ARGV[2], 1)
"#;

const MOVE_TO_ERROR: &str = r#"
local p = KEYS[1]
local id = ARGV[1]
local key = p .. ':msg:' .. id
if redis.call('EXISTS', key) == 0 then
  return 0
end
drop_indexes(p, id, redis.call('HGET', key, 'route'))
local error_key = p .. ':error:' .. id
redis.call('RENAME', key, error_key)
redis.call('HSET', error_key, 'status', '2', 'last_exception', ARGV[2], 'last_exception_at', ARGV[3])
redis.call('HDEL', error_key, 'heartbeat')
redis.call('ZADD', p .. ':errors', id, id)
redis.call('ZADD', p .. ':errors_at', ARGV[3], id)
set_status(p, ARGV[4], id, '2')
return 1
"#;

const PROMOTE: &str = r#"
return promote(KEYS[1], ARGV[1], tonumber(ARGV[2]))
"#;

// Leased ids are kept out of `expiry`, so the first `limit` members are
// always removable.
const REMOVE_EXPIRED: &str = r#"
local p = KEYS[1]
local due = redis.call('ZRANGEBYSCORE', p .. ':expiry', '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local removed = {}
for _, id in ipairs(due) do
  local key = p .. ':msg:' .. id
  if redis.call('EXISTS', key) == 0 or redis.call('HEXISTS', key, 'heartbeat') == 1 then
    redis.call('ZREM', p .. ':expiry', id)
  else
    local cid = redis.call('HGET', key, 'correlation_id')
    drop_indexes(p, id, redis.call('HGET', key, 'route'))
    redis.call('DEL', key, p .. ':tracking:' .. id)
    drop_status(p, ARGV[3], id, cid)
    table.insert(removed, tonumber(id))
  end
end
return removed
"#;

const PURGE_ERRORS: &str = r#"
local p = KEYS[1]
local max = '+inf'
if ARGV[1] ~= '' then
  max = '(' .. ARGV[1]
end
local ids = redis.call('ZRANGEBYSCORE', p .. ':errors_at', '-inf', max)
for _, id in ipairs(ids) do
  local error_key = p .. ':error:' .. id
  local cid = redis.call('HGET', error_key, 'correlation_id')
  redis.call('DEL', error_key, p .. ':tracking:' .. id)
  redis.call('ZREM', p .. ':errors', id)
  redis.call('ZREM', p .. ':errors_at', id)
  drop_status(p, ARGV[2], id, cid)
end
return #ids
"#;

// Latest status row among the messages sharing a correlation id.
const STATUS: &str = r#"
local p = KEYS[1]
local ids = redis.call('ZREVRANGE', p .. ':cid:' .. ARGV[1], 0, 0)
if #ids == 0 then
  return false
end
return redis.call('HGETALL', p .. ':status:' .. ids[1])
"#;

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    complete: Script,
    rollback: Script,
    heartbeat: Script,
    reset_heartbeats: Script,
    record_error: Script,
    move_to_error: Script,
    promote: Script,
    remove_expired: Script,
    purge_errors: Script,
    status: Script,
}

impl Scripts {
    fn load() -> Self {
        let with_helpers = |body: &str| Script::new(&format!("{HELPERS}\n{body}"));
        Self {
            enqueue: with_helpers(ENQUEUE),
            dequeue: with_helpers(DEQUEUE),
            complete: with_helpers(COMPLETE),
            rollback: with_helpers(ROLLBACK),
            heartbeat: Script::new(HEARTBEAT),
            reset_heartbeats: with_helpers(RESET_HEARTBEATS),
            record_error: Script::new(RECORD_ERROR),
            move_to_error: with_helpers(MOVE_TO_ERROR),
            promote: with_helpers(PROMOTE),
            remove_expired: with_helpers(REMOVE_EXPIRED),
            purge_errors: with_helpers(PURGE_ERRORS),
            status: Script::new(STATUS),
        }
    }
}

fn write_err(operation: &'static str) -> impl FnOnce(redis::RedisError) -> QueueError {
    move |e| QueueError::store_write(operation, e)
}

fn read_err(operation: &'static str) -> impl FnOnce(redis::RedisError) -> QueueError {
    move |e| QueueError::store_read(operation, e)
}

fn flag(enabled: bool) -> &'static str {
    if enabled { "1" } else { "0" }
}

/// Rank 0 sorts last; priority `p` maps to rank `p + 1`.
fn rank(priority: Option<u8>) -> u16 {
    priority.map(|p| u16::from(p) + 1).unwrap_or(0)
}

type RawHash = HashMap<String, Vec<u8>>;

/// Raw hash fields as returned by HGETALL.
struct Fields(RawHash);

impl Fields {
    fn bytes(&mut self, field: &str) -> Vec<u8> {
        self.0.remove(field).unwrap_or_default()
    }

    fn text(&self, field: &str) -> Result<String> {
        let raw = self.0.get(field).ok_or_else(|| {
            QueueError::store_read("decode hash", format!("missing field `{field}`"))
        })?;
        String::from_utf8(raw.clone()).map_err(|e| QueueError::store_read("decode hash", e))
    }

    /// Empty string means null.
    fn optional_text(&self, field: &str) -> Result<Option<String>> {
        match self.0.get(field) {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(_) => self.text(field).map(Some),
        }
    }

    fn integer(&self, field: &str) -> Result<i64> {
        self.text(field)?
            .parse()
            .map_err(|e| QueueError::store_read("decode hash", e))
    }

    fn optional_integer(&self, field: &str) -> Result<Option<i64>> {
        self.optional_text(field)?
            .map(|raw| {
                raw.parse()
                    .map_err(|e| QueueError::store_read("decode hash", e))
            })
            .transpose()
    }

    fn millis(&self, field: &str) -> Result<DateTime<Utc>> {
        self.integer(field).map(from_millis)
    }

    fn optional_millis(&self, field: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.optional_integer(field)?.map(from_millis))
    }

    fn correlation_id(&self) -> Result<CorrelationId> {
        self.text("correlation_id")?
            .parse()
            .map_err(|e| QueueError::store_read("decode correlation id", e))
    }

    fn priority(&self) -> Result<Option<u8>> {
        Ok(self
            .optional_integer("priority")?
            .and_then(|p| u8::try_from(p).ok()))
    }

    fn delivery_count(&self) -> Result<u32> {
        Ok(u32::try_from(self.integer("delivery_count")?).unwrap_or(u32::MAX))
    }

    fn columns(&self) -> Result<AdditionalColumns> {
        match self.optional_text("columns")? {
            None => Ok(AdditionalColumns::new()),
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| QueueError::Serialization(format!("columns: {e}"))),
        }
    }
}

pub struct RedisStore {
    connection: ConnectionManager,
    prefix: String,
    options: QueueOptions,
    scripts: Scripts,
}

impl RedisStore {
    pub async fn connect(url: &str, namespace: &str, options: &QueueOptions) -> Result<Self> {
        options.validate()?;
        let client = redis::Client::open(url).map_err(read_err("connect"))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(read_err("connect"))?;
        debug!(queue = %options.name, namespace, "redis store connected");
        Ok(Self::from_connection(connection, namespace, options))
    }

    pub fn from_connection(
        connection: ConnectionManager,
        namespace: &str,
        options: &QueueOptions,
    ) -> Self {
        Self {
            connection,
            prefix: format!("{namespace}:{{{}}}", options.name),
            options: options.clone(),
            scripts: Scripts::load(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    fn status_flag(&self) -> &'static str {
        flag(self.options.enable_status_table)
    }

    async fn hash(&self, key: &str, operation: &'static str) -> Result<Fields> {
        let mut conn = self.connection.clone();
        let map: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(read_err(operation))?;
        Ok(Fields(map))
    }

    fn leased_record(
        queue_id: QueueId,
        mut fields: Fields,
        tracking: RawHash,
    ) -> Result<MessageRecord> {
        let mut error_counts = tracking
            .into_iter()
            .map(|(exception_type, raw)| -> Result<ErrorTrackingRecord> {
                let retry_count = String::from_utf8(raw)
                    .ok()
                    .and_then(|count| count.parse().ok())
                    .ok_or_else(|| {
                        QueueError::store_read("decode tracking", "retry count is not a number")
                    })?;
                Ok(ErrorTrackingRecord {
                    queue_id,
                    exception_type,
                    retry_count,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        error_counts.sort_by(|a, b| a.exception_type.cmp(&b.exception_type));

        Ok(MessageRecord {
            queue_id,
            correlation_id: fields.correlation_id()?,
            status: MessageStatus::Processing,
            queued_at: fields.millis("queued_at")?,
            process_at: fields.millis("process_at")?,
            heartbeat: fields.optional_millis("heartbeat")?,
            expires_at: fields.optional_millis("expires_at")?,
            route: fields.optional_text("route")?,
            priority: fields.priority()?,
            job_name: fields.optional_text("job_name")?,
            columns: fields.columns()?,
            delivery_count: fields.delivery_count()?,
            error_counts,
            body: fields.bytes("body"),
            headers: fields.bytes("headers"),
        })
    }

    fn error_record(queue_id: QueueId, mut fields: Fields) -> Result<MetaDataErrorsRecord> {
        Ok(MetaDataErrorsRecord {
            queue_id,
            correlation_id: fields.correlation_id()?,
            queued_at: fields.millis("queued_at")?,
            process_at: fields.millis("process_at")?,
            expires_at: fields.optional_millis("expires_at")?,
            route: fields.optional_text("route")?,
            priority: fields.priority()?,
            job_name: fields.optional_text("job_name")?,
            columns: fields.columns()?,
            delivery_count: fields.delivery_count()?,
            last_exception: fields.text("last_exception")?,
            last_exception_at: fields.millis("last_exception_at")?,
            body: fields.bytes("body"),
            headers: fields.bytes("headers"),
        })
    }
}

#[async_trait]
impl StoreAdapter for RedisStore {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn create(&self) -> Result<bool> {
        let options_json = serde_json::to_string(&self.options)
            .map_err(|e| QueueError::Serialization(format!("queue options: {e}")))?;
        let mut conn = self.connection.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.key("config"))
            .arg(options_json)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(write_err("create"))?;
        let created = set.is_some();
        if created {
            info!(queue = %self.options.name, prefix = %self.prefix, "created redis queue");
        }
        Ok(created)
    }

    async fn exists(&self) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key("config"))
            .query_async(&mut conn)
            .await
            .map_err(read_err("exists"))?;
        Ok(exists)
    }

    async fn remove(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}:*", self.prefix);
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(write_err("remove"))?;
            if !keys.is_empty() {
                let _: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(write_err("remove"))?;
            }
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        info!(queue = %self.options.name, "removed redis queue");
        Ok(())
    }

    async fn enqueue(&self, message: NewMessage) -> Result<QueueId> {
        let columns_json = serde_json::to_string(&message.columns)
            .map_err(|e| QueueError::Serialization(format!("columns: {e}")))?;
        let mut conn = self.connection.clone();
        let id: i64 = self
            .scripts
            .enqueue
            .key(&self.prefix)
            .arg(&message.body[..])
            .arg(&message.headers[..])
            .arg(message.correlation_id.to_string())
            .arg(to_millis(message.queued_at))
            .arg(to_millis(message.process_at))
            .arg(
                message
                    .expires_at
                    .map(|at| to_millis(at).to_string())
                    .unwrap_or_default(),
            )
            .arg(message.route.clone().unwrap_or_default())
            .arg(message.priority.map(|p| p.to_string()).unwrap_or_default())
            .arg(message.job_name.clone().unwrap_or_default())
            .arg(columns_json)
            .arg(rank(message.priority))
            .arg(self.status_flag())
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("enqueue"))?;
        Ok(QueueId::new(id))
    }

    async fn dequeue(&self, request: &DequeueRequest) -> Result<Option<MessageRecord>> {
        let mut conn = self.connection.clone();
        let leased: Option<(i64, RawHash, RawHash)> = self
            .scripts
            .dequeue
            .key(&self.prefix)
            .arg(to_millis(request.now))
            .arg(request.route.clone().unwrap_or_default())
            .arg(self.status_flag())
            .arg(INLINE_PROMOTE_LIMIT)
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("dequeue"))?;
        let Some((id, fields, tracking)) = leased else {
            return Ok(None);
        };
        let queue_id = QueueId::new(id);
        Self::leased_record(queue_id, Fields(fields), tracking)
            .map(Some)
            .map_err(|e| QueueError::Poison {
                queue_id,
                reason: e.to_string(),
            })
    }

    async fn complete(&self, queue_id: QueueId) -> Result<()> {
        let mut conn = self.connection.clone();
        let done: i64 = self
            .scripts
            .complete
            .key(&self.prefix)
            .arg(queue_id.as_i64())
            .arg(self.status_flag())
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("complete"))?;
        if done == 0 {
            return Err(QueueError::NotFound(queue_id));
        }
        Ok(())
    }

    async fn rollback(&self, queue_id: QueueId, process_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut conn = self.connection.clone();
        let done: i64 = self
            .scripts
            .rollback
            .key(&self.prefix)
            .arg(queue_id.as_i64())
            .arg(process_at.map(|at| to_millis(at).to_string()).unwrap_or_default())
            .arg(self.status_flag())
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("rollback"))?;
        if done == 0 {
            return Err(QueueError::NotFound(queue_id));
        }
        Ok(())
    }

    async fn send_heartbeat(&self, queue_id: QueueId, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.connection.clone();
        let done: i64 = self
            .scripts
            .heartbeat
            .key(&self.prefix)
            .arg(queue_id.as_i64())
            .arg(to_millis(now))
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("send heartbeat"))?;
        if done == 0 {
            return Err(QueueError::NotFound(queue_id));
        }
        Ok(())
    }

    async fn reset_expired_heartbeats(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueId>> {
        let mut conn = self.connection.clone();
        let ids: Vec<i64> = self
            .scripts
            .reset_heartbeats
            .key(&self.prefix)
            .arg(to_millis(cutoff))
            .arg(limit)
            .arg(self.status_flag())
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("reset heartbeats"))?;
        Ok(ids.into_iter().map(QueueId::new).collect())
    }

    async fn record_error(&self, queue_id: QueueId, exception_type: &str) -> Result<u32> {
        let mut conn = self.connection.clone();
        let count: Option<i64> = self
            .scripts
            .record_error
            .key(&self.prefix)
            .arg(queue_id.as_i64())
            .arg(exception_type)
            .invoke_async(&mut conn)
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
        let mut conn = self.connection.clone();
        let done: i64 = self
            .scripts
            .move_to_error
            .key(&self.prefix)
            .arg(queue_id.as_i64())
            .arg(exception)
            .arg(to_millis(now))
            .arg(self.status_flag())
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("move to error queue"))?;
        if done == 0 {
            return Err(QueueError::NotFound(queue_id));
        }
        Ok(())
    }

    async fn promote_delayed(&self, now: DateTime<Utc>, limit: usize) -> Result<u64> {
        let mut conn = self.connection.clone();
        let promoted: u64 = self
            .scripts
            .promote
            .key(&self.prefix)
            .arg(to_millis(now))
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("promote delayed"))?;
        Ok(promoted)
    }

    async fn remove_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueId>> {
        let mut conn = self.connection.clone();
        let ids: Vec<i64> = self
            .scripts
            .remove_expired
            .key(&self.prefix)
            .arg(to_millis(now))
            .arg(limit)
            .arg(self.status_flag())
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("remove expired"))?;
        Ok(ids.into_iter().map(QueueId::new).collect())
    }

    async fn purge_error_messages(&self, filter: PurgeFilter) -> Result<u64> {
        let cutoff = match filter {
            PurgeFilter::All => String::new(),
            PurgeFilter::OlderThan(at) => to_millis(at).to_string(),
        };
        let mut conn = self.connection.clone();
        let purged: u64 = self
            .scripts
            .purge_errors
            .key(&self.prefix)
            .arg(cutoff)
            .arg(self.status_flag())
            .invoke_async(&mut conn)
            .await
            .map_err(write_err("purge errors"))?;
        Ok(purged)
    }

    async fn status(&self, correlation_id: CorrelationId) -> Result<Option<StatusRecord>> {
        if !self.options.enable_status_table {
            return Ok(None);
        }
        let mut conn = self.connection.clone();
        let row: Option<RawHash> = self
            .scripts
            .status
            .key(&self.prefix)
            .arg(correlation_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(read_err("status"))?;
        let Some(fields) = row.filter(|row| !row.is_empty()).map(Fields) else {
            return Ok(None);
        };
        let raw_status = fields.integer("status")?;
        let status = MessageStatus::from_i64(raw_status).ok_or_else(|| {
            QueueError::store_read("decode status", format!("unknown status {raw_status}"))
        })?;
        Ok(Some(StatusRecord {
            queue_id: QueueId::new(fields.integer("queue_id")?),
            correlation_id,
            status,
            job_name: fields.optional_text("job_name")?,
        }))
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts> {
        let now = to_millis(now);
        let mut conn = self.connection.clone();
        let (ready, due, not_due, working, errors): (u64, u64, u64, u64, u64) = redis::pipe()
            .cmd("ZCARD")
            .arg(self.key("ready"))
            .cmd("ZCOUNT")
            .arg(self.key("delayed"))
            .arg("-inf")
            .arg(now)
            .cmd("ZCOUNT")
            .arg(self.key("delayed"))
            .arg(format!("({now}"))
            .arg("+inf")
            .cmd("ZCARD")
            .arg(self.key("working"))
            .cmd("ZCARD")
            .arg(self.key("errors"))
            .query_async(&mut conn)
            .await
            .map_err(read_err("counts"))?;
        Ok(QueueCounts {
            waiting: ready + due,
            processing: working,
            delayed: not_due,
            error: errors,
        })
    }

    async fn error_messages(&self, limit: usize) -> Result<Vec<MetaDataErrorsRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let ids: Vec<i64> = redis::cmd("ZRANGE")
            .arg(self.key("errors"))
            .arg(0)
            .arg(limit.saturating_sub(1))
            .query_async(&mut conn)
            .await
            .map_err(read_err("error messages"))?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let fields = self
                .hash(&self.key(&format!("error:{id}")), "error messages")
                .await?;
            records.push(Self::error_record(QueueId::new(id), fields)?);
        }
        Ok(records)
    }

    async fn error_tracking(&self, queue_id: QueueId) -> Result<Vec<ErrorTrackingRecord>> {
        let mut conn = self.connection.clone();
        let map: HashMap<String, u32> = redis::cmd("HGETALL")
            .arg(self.key(&format!("tracking:{queue_id}")))
            .query_async(&mut conn)
            .await
            .map_err(read_err("error tracking"))?;
        let mut rows: Vec<ErrorTrackingRecord> = map
            .into_iter()
            .map(|(exception_type, retry_count)| ErrorTrackingRecord {
                queue_id,
                exception_type,
                retry_count,
            })
            .collect();
        rows.sort_by(|a, b| a.exception_type.cmp(&b.exception_type));
        Ok(rows)
    }
}
