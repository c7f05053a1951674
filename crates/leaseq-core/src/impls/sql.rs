//! SQL statement text for one queue.
//!
//! Table names derive from the queue name, and the metadata table grows one
//! `col_<name>` column per declared additional column, so statements are
//! generated once when the store is opened and reused for every call.
//! Parameters use numbered placeholders (`$1`) so a value can appear twice.

use crate::config::QueueOptions;

/// Tables owned by one queue.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub queue: String,
    pub metadata: String,
    pub errors: String,
    pub error_tracking: String,
    pub status: String,
    pub configuration: String,
}

impl TableNames {
    pub fn new(queue_name: &str) -> Self {
        Self {
            queue: format!("{queue_name}_queue"),
            metadata: format!("{queue_name}_metadata"),
            errors: format!("{queue_name}_errors"),
            error_tracking: format!("{queue_name}_error_tracking"),
            status: format!("{queue_name}_status"),
            configuration: format!("{queue_name}_configuration"),
        }
    }

    pub fn all(&self) -> [&str; 6] {
        [
            &self.queue,
            &self.metadata,
            &self.errors,
            &self.error_tracking,
            &self.status,
            &self.configuration,
        ]
    }
}

pub fn column_name(name: &str) -> String {
    format!("col_{name}")
}

const META_COLUMNS: &str = "queue_id, correlation_id, status, queued_at, process_at, heartbeat, \
     expires_at, route, priority, job_name, delivery_count";

#[derive(Debug, Clone)]
pub struct SqlCommands {
    pub tables: TableNames,
    pub create_tables: Vec<String>,
    pub insert_body: String,
    pub insert_metadata: String,
    pub insert_status: String,
    pub update_status: String,
    pub delete_status: String,
    pub select_candidate: String,
    pub select_candidate_by_route: String,
    pub claim: String,
    pub select_leased: String,
    pub select_tracking: String,
    pub complete: String,
    pub delete_body: String,
    pub delete_tracking: String,
    pub rollback: String,
    pub heartbeat: String,
    pub reset_heartbeats: String,
    pub record_error: String,
    pub take_metadata: String,
    pub take_body: String,
    pub insert_error: String,
    pub remove_expired: String,
    pub purge_errors: String,
    pub counts: String,
    pub count_errors: String,
    pub select_status: String,
    pub select_errors: String,
    pub insert_configuration: String,
    pub select_configuration: String,
    pub table_exists: String,
}

impl SqlCommands {
    pub fn new(options: &QueueOptions) -> Self {
        let t = TableNames::new(&options.name);
        let schema = &options.additional_columns;

        let extra_defs: String = schema
            .iter()
            .map(|c| format!(",\n    {} {}", column_name(&c.name), c.column_type.sql_type()))
            .collect();
        let extra_names: String = schema
            .iter()
            .map(|c| format!(", {}", column_name(&c.name)))
            .collect();
        let extra_params: String = (0..schema.iter().count())
            .map(|i| format!(", ${}", i + 9))
            .collect();

        let order = if options.enable_priority {
            "priority DESC, queue_id ASC"
        } else {
            "queue_id ASC"
        };

        let mut create_tables = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {q} (
    queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
    body BLOB NOT NULL,
    headers BLOB NOT NULL
)",
                q = t.queue
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {m} (
    queue_id INTEGER PRIMARY KEY,
    correlation_id TEXT NOT NULL,
    status INTEGER NOT NULL,
    queued_at INTEGER NOT NULL,
    process_at INTEGER NOT NULL,
    heartbeat INTEGER NULL,
    expires_at INTEGER NULL,
    route TEXT NULL,
    priority INTEGER NULL,
    job_name TEXT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 0{extra_defs}
)",
                m = t.metadata
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {m}_ready ON {m} (status, heartbeat, process_at)",
                m = t.metadata
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {m}_expires ON {m} (expires_at)",
                m = t.metadata
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {e} (
    queue_id INTEGER PRIMARY KEY,
    correlation_id TEXT NOT NULL,
    body BLOB NOT NULL,
    headers BLOB NOT NULL,
    queued_at INTEGER NOT NULL,
    process_at INTEGER NOT NULL,
    expires_at INTEGER NULL,
    route TEXT NULL,
    priority INTEGER NULL,
    job_name TEXT NULL,
    delivery_count INTEGER NOT NULL,
    columns TEXT NOT NULL,
    last_exception TEXT NOT NULL,
    last_exception_at INTEGER NOT NULL
)",
                e = t.errors
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {et} (
    queue_id INTEGER NOT NULL,
    exception_type TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    PRIMARY KEY (queue_id, exception_type)
)",
                et = t.error_tracking
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {c} (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    options TEXT NOT NULL,
    created_at INTEGER NOT NULL
)",
                c = t.configuration
            ),
        ];
        if options.enable_status_table {
            create_tables.push(format!(
                "CREATE TABLE IF NOT EXISTS {s} (
    queue_id INTEGER PRIMARY KEY,
    correlation_id TEXT NOT NULL,
    status INTEGER NOT NULL,
    job_name TEXT NULL
)",
                s = t.status
            ));
            create_tables.push(format!(
                "CREATE INDEX IF NOT EXISTS {s}_correlation_id ON {s} (correlation_id)",
                s = t.status
            ));
        }

        let candidate_with = |route_filter: &str| {
            format!(
                "SELECT queue_id FROM {m}
WHERE status = 0 AND heartbeat IS NULL AND process_at <= $1
  AND (expires_at IS NULL OR expires_at > $1){route_filter}
ORDER BY {order}
LIMIT 1",
                m = t.metadata
            )
        };

        Self {
            create_tables,
            insert_body: format!(
                "INSERT INTO {} (body, headers) VALUES ($1, $2) RETURNING queue_id",
                t.queue
            ),
            insert_metadata: format!(
                "INSERT INTO {} ({META_COLUMNS}{extra_names})
VALUES ($1, $2, 0, $3, $4, NULL, $5, $6, $7, $8, 0{extra_params})",
                t.metadata
            ),
            insert_status: format!(
                "INSERT INTO {} (queue_id, correlation_id, status, job_name) VALUES ($1, $2, $3, $4)",
                t.status
            ),
            update_status: format!("UPDATE {} SET status = $2 WHERE queue_id = $1", t.status),
            delete_status: format!("DELETE FROM {} WHERE queue_id = $1", t.status),
            select_candidate: candidate_with(""),
            select_candidate_by_route: candidate_with("\n  AND route = $2"),
            claim: format!(
                "UPDATE {} SET heartbeat = $1, status = 1, delivery_count = delivery_count + 1
WHERE queue_id = $2 AND status = 0 AND heartbeat IS NULL
  AND (expires_at IS NULL OR expires_at > $1)
RETURNING queue_id",
                t.metadata
            ),
            select_leased: format!(
                "SELECT m.*, q.body, q.headers FROM {m} m JOIN {q} q ON q.queue_id = m.queue_id
WHERE m.queue_id = $1",
                m = t.metadata,
                q = t.queue
            ),
            select_tracking: format!(
                "SELECT exception_type, retry_count FROM {} WHERE queue_id = $1 ORDER BY exception_type",
                t.error_tracking
            ),
            complete: format!(
                "DELETE FROM {} WHERE queue_id = $1 RETURNING queue_id",
                t.metadata
            ),
            delete_body: format!("DELETE FROM {} WHERE queue_id = $1", t.queue),
            delete_tracking: format!("DELETE FROM {} WHERE queue_id = $1", t.error_tracking),
            rollback: format!(
                "UPDATE {} SET heartbeat = NULL, status = 0, process_at = COALESCE($2, process_at)
WHERE queue_id = $1",
                t.metadata
            ),
            heartbeat: format!(
                "UPDATE {} SET heartbeat = $2 WHERE queue_id = $1 AND heartbeat IS NOT NULL",
                t.metadata
            ),
            reset_heartbeats: format!(
                "UPDATE {m} SET heartbeat = NULL, status = 0
WHERE queue_id IN (
    SELECT queue_id FROM {m}
    WHERE status = 1 AND heartbeat < $1
    ORDER BY queue_id
    LIMIT $2
) AND status = 1 AND heartbeat < $1
RETURNING queue_id",
                m = t.metadata
            ),
            record_error: format!(
                "INSERT INTO {et} (queue_id, exception_type, retry_count)
SELECT queue_id, $2, 1 FROM {m} WHERE queue_id = $1
ON CONFLICT (queue_id, exception_type) DO UPDATE SET retry_count = retry_count + 1
RETURNING retry_count",
                et = t.error_tracking,
                m = t.metadata
            ),
            take_metadata: format!("DELETE FROM {} WHERE queue_id = $1 RETURNING *", t.metadata),
            take_body: format!(
                "DELETE FROM {} WHERE queue_id = $1 RETURNING body, headers",
                t.queue
            ),
            insert_error: format!(
                "INSERT INTO {} (queue_id, correlation_id, body, headers, queued_at, process_at,
    expires_at, route, priority, job_name, delivery_count, columns, last_exception, last_exception_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                t.errors
            ),
            remove_expired: format!(
                "DELETE FROM {m}
WHERE queue_id IN (
    SELECT queue_id FROM {m}
    WHERE expires_at IS NOT NULL AND expires_at <= $1 AND heartbeat IS NULL
    ORDER BY queue_id
    LIMIT $2
) AND heartbeat IS NULL
RETURNING queue_id",
                m = t.metadata
            ),
            purge_errors: format!(
                "DELETE FROM {} WHERE $1 IS NULL OR last_exception_at < $1 RETURNING queue_id",
                t.errors
            ),
            counts: format!(
                "SELECT
    COALESCE(SUM(CASE WHEN heartbeat IS NULL AND process_at <= $1 THEN 1 ELSE 0 END), 0) AS waiting,
    COALESCE(SUM(CASE WHEN heartbeat IS NOT NULL THEN 1 ELSE 0 END), 0) AS processing,
    COALESCE(SUM(CASE WHEN heartbeat IS NULL AND process_at > $1 THEN 1 ELSE 0 END), 0) AS delayed
FROM {}",
                t.metadata
            ),
            count_errors: format!("SELECT COUNT(*) FROM {}", t.errors),
            select_status: format!(
                "SELECT queue_id, status, job_name FROM {} WHERE correlation_id = $1
ORDER BY queue_id DESC LIMIT 1",
                t.status
            ),
            select_errors: format!("SELECT * FROM {} ORDER BY queue_id LIMIT $1", t.errors),
            insert_configuration: format!(
                "INSERT OR IGNORE INTO {} (id, options, created_at) VALUES (1, $1, $2)",
                t.configuration
            ),
            select_configuration: format!("SELECT options FROM {} WHERE id = 1", t.configuration),
            table_exists: "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = $1"
                .to_string(),
            tables: t,
        }
    }
}
