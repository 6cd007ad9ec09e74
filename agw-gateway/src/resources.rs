//! Shared, named Redis clients and SQL pools used by plugin host calls.
//!
//! Pools are reconciled on every snapshot apply: entries are created for new
//! names, recreated when the target address or connection string changes,
//! and dropped when the name disappears. Connections are established lazily
//! so an unreachable backend degrades to per-call errors instead of blocking
//! configuration.

use agw_core::{DbKind, ExternalResources};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use serde_json::json;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{MySqlPool, PgPool, Row, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const REDIS_DEADLINE: Duration = Duration::from_millis(500);
const DB_DEADLINE: Duration = Duration::from_secs(1);
const DB_MAX_CONNECTIONS: u32 = 20;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Result frame handed back to a plugin: one status byte, then a JSON
/// payload. Status 0 carries the reply, 1 is a nil reply, 2 an error
/// message, 3 a cancelled call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostResponse {
    pub status: u8,
    pub payload: Vec<u8>,
}

pub const STATUS_OK: u8 = 0;
pub const STATUS_NIL: u8 = 1;
pub const STATUS_ERROR: u8 = 2;
pub const STATUS_CANCELLED: u8 = 3;

// === impl HostResponse ===

impl HostResponse {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: STATUS_OK,
            payload,
        }
    }

    pub fn nil() -> Self {
        Self {
            status: STATUS_NIL,
            payload: Vec::new(),
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            status: STATUS_ERROR,
            payload: message.to_string().into_bytes(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: STATUS_CANCELLED,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + self.payload.len());
        frame.push(self.status);
        frame.extend_from_slice(&self.payload);
        frame
    }
}

struct RedisEntry {
    address: String,
    client: redis::Client,
    // Established on first use and reused; the manager reconnects on its own
    // after transient failures.
    manager: Mutex<Option<ConnectionManager>>,
}

enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

struct DbEntry {
    kind: DbKind,
    connection_string: String,
    pool: DbPool,
}

#[derive(Default)]
pub struct Pools {
    redis: RwLock<HashMap<String, Arc<RedisEntry>>>,
    databases: RwLock<HashMap<String, Arc<DbEntry>>>,
}

// === impl Pools ===

impl Pools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reconciles both pool maps against the snapshot's resource set.
    pub fn reconcile(&self, resources: &ExternalResources) {
        {
            let mut redis = self.redis.write();
            redis.retain(|name, _| {
                let keep = resources.redis.iter().any(|r| &r.name == name);
                if !keep {
                    info!(name = %name, "redis resource removed");
                }
                keep
            });
            for config in &resources.redis {
                let unchanged = redis
                    .get(&config.name)
                    .is_some_and(|entry| entry.address == config.address);
                if unchanged {
                    continue;
                }
                match redis::Client::open(config.address.as_str()) {
                    Ok(client) => {
                        info!(name = %config.name, address = %config.address, "redis client (re)created");
                        redis.insert(
                            config.name.clone(),
                            Arc::new(RedisEntry {
                                address: config.address.clone(),
                                client,
                                manager: Mutex::new(None),
                            }),
                        );
                    }
                    Err(error) => {
                        warn!(name = %config.name, %error, "invalid redis address; removing entry");
                        redis.remove(&config.name);
                    }
                }
            }
        }

        {
            let mut databases = self.databases.write();
            databases.retain(|name, _| {
                let keep = resources.databases.iter().any(|db| &db.name == name);
                if !keep {
                    info!(name = %name, "database resource removed");
                }
                keep
            });
            for config in &resources.databases {
                let unchanged = databases.get(&config.name).is_some_and(|entry| {
                    entry.kind == config.kind
                        && entry.connection_string == config.connection_string
                });
                if unchanged {
                    continue;
                }
                match DbPool::connect_lazy(config.kind, &config.connection_string) {
                    Ok(pool) => {
                        info!(name = %config.name, kind = %config.kind, "database pool (re)created");
                        databases.insert(
                            config.name.clone(),
                            Arc::new(DbEntry {
                                kind: config.kind,
                                connection_string: config.connection_string.clone(),
                                pool,
                            }),
                        );
                    }
                    Err(error) => {
                        warn!(name = %config.name, %error, "invalid connection string; removing entry");
                        databases.remove(&config.name);
                    }
                }
            }
        }
    }

    /// Issues a whitespace-tokenized command (`INCR rl:a` etc.) against the
    /// named Redis resource, under the host-call deadline.
    pub async fn redis_command(&self, name: &str, command: &str) -> HostResponse {
        let Some(entry) = self.redis.read().get(name).cloned() else {
            return HostResponse::error(format!("unknown redis resource: {name}"));
        };

        let mut tokens = command.split_whitespace();
        let Some(first) = tokens.next() else {
            return HostResponse::error("empty redis command");
        };
        let mut cmd = redis::cmd(first);
        for arg in tokens {
            cmd.arg(arg);
        }

        let reply = tokio::time::timeout(REDIS_DEADLINE, async {
            let mut manager = entry.manager().await?;
            cmd.query_async::<redis::Value>(&mut manager).await
        })
        .await;

        match reply {
            Ok(Ok(redis::Value::Nil)) => HostResponse::nil(),
            Ok(Ok(value)) => match serde_json::to_vec(&redis_value_to_json(value)) {
                Ok(payload) => HostResponse::ok(payload),
                Err(error) => HostResponse::error(error),
            },
            Ok(Err(error)) => {
                debug!(resource = %name, %error, "redis command failed");
                HostResponse::error(error)
            }
            Err(_) => HostResponse::error("redis deadline exceeded"),
        }
    }

    /// Runs a read-only query against the named database, returning rows as
    /// a JSON array of arrays of strings.
    pub async fn db_query(&self, name: &str, sql: &str) -> HostResponse {
        let Some(entry) = self.databases.read().get(name).cloned() else {
            return HostResponse::error(format!("unknown database resource: {name}"));
        };

        if !is_read_only(sql) {
            return HostResponse::error("only SELECT queries are allowed");
        }

        let rows = tokio::time::timeout(DB_DEADLINE, entry.pool.fetch_rows(sql)).await;
        match rows {
            Ok(Ok(rows)) => match serde_json::to_vec(&rows) {
                Ok(payload) => HostResponse::ok(payload),
                Err(error) => HostResponse::error(error),
            },
            Ok(Err(error)) => {
                debug!(resource = %name, %error, "database query failed");
                HostResponse::error(error)
            }
            Err(_) => HostResponse::error("database deadline exceeded"),
        }
    }
}

impl RedisEntry {
    async fn manager(&self) -> redis::RedisResult<ConnectionManager> {
        let mut slot = self.manager.lock().await;
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }
        let manager = self.client.get_connection_manager().await?;
        *slot = Some(manager.clone());
        Ok(manager)
    }
}

// === impl DbPool ===

impl DbPool {
    fn connect_lazy(kind: DbKind, connection_string: &str) -> Result<Self, sqlx::Error> {
        match kind {
            DbKind::Postgres => PgPoolOptions::new()
                .max_connections(DB_MAX_CONNECTIONS)
                .idle_timeout(IDLE_TIMEOUT)
                .acquire_timeout(DB_DEADLINE)
                .connect_lazy(connection_string)
                .map(Self::Postgres),
            DbKind::MySql => MySqlPoolOptions::new()
                .max_connections(DB_MAX_CONNECTIONS)
                .idle_timeout(IDLE_TIMEOUT)
                .acquire_timeout(DB_DEADLINE)
                .connect_lazy(connection_string)
                .map(Self::MySql),
        }
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Vec<String>>, sqlx::Error> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await?;
                Ok(rows.iter().map(pg_row_to_strings).collect())
            }
            Self::MySql(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await?;
                Ok(rows.iter().map(mysql_row_to_strings).collect())
            }
        }
    }
}

/// Accepts only statements that begin with SELECT; everything else is
/// rejected before it reaches a driver.
fn is_read_only(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"))
}

fn redis_value_to_json(value: redis::Value) -> serde_json::Value {
    use redis::Value;
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Okay => json!("OK"),
        Value::Int(i) => json!(i),
        Value::Double(d) => json!(d),
        Value::Boolean(b) => json!(b),
        Value::SimpleString(s) => json!(s),
        Value::BulkString(bytes) => json!(String::from_utf8_lossy(&bytes)),
        Value::Array(items) | Value::Set(items) => {
            items.into_iter().map(redis_value_to_json).collect()
        }
        Value::Map(pairs) => pairs
            .into_iter()
            .map(|(k, v)| {
                serde_json::Value::Array(vec![redis_value_to_json(k), redis_value_to_json(v)])
            })
            .collect(),
        Value::VerbatimString { text, .. } => json!(text),
        other => json!(format!("{other:?}")),
    }
}

fn pg_row_to_strings(row: &PgRow) -> Vec<String> {
    (0..row.columns().len())
        .map(|index| pg_column_to_string(row, index))
        .collect()
}

fn pg_column_to_string(row: &PgRow, index: usize) -> String {
    let Ok(raw) = row.try_get_raw(index) else {
        return String::new();
    };
    if raw.is_null() {
        return String::new();
    }
    let type_name = raw.type_info().name().to_string();
    match type_name.as_str() {
        "INT2" => decode(row, index, |v: i16| v.to_string()),
        "INT4" => decode(row, index, |v: i32| v.to_string()),
        "INT8" => decode(row, index, |v: i64| v.to_string()),
        "FLOAT4" => decode(row, index, |v: f32| v.to_string()),
        "FLOAT8" => decode(row, index, |v: f64| v.to_string()),
        "BOOL" => decode(row, index, |v: bool| v.to_string()),
        _ => decode(row, index, |v: String| v),
    }
}

fn mysql_row_to_strings(row: &MySqlRow) -> Vec<String> {
    (0..row.columns().len())
        .map(|index| mysql_column_to_string(row, index))
        .collect()
}

fn mysql_column_to_string(row: &MySqlRow, index: usize) -> String {
    let Ok(raw) = row.try_get_raw(index) else {
        return String::new();
    };
    if raw.is_null() {
        return String::new();
    }
    let type_name = raw.type_info().name().to_string();
    match type_name.as_str() {
        "TINYINT" | "SMALLINT" | "INT" | "MEDIUMINT" | "BIGINT" => {
            decode(row, index, |v: i64| v.to_string())
        }
        "FLOAT" => decode(row, index, |v: f32| v.to_string()),
        "DOUBLE" => decode(row, index, |v: f64| v.to_string()),
        "BOOLEAN" => decode(row, index, |v: bool| v.to_string()),
        _ => decode(row, index, |v: String| v),
    }
}

fn decode<'r, R, T>(row: &'r R, index: usize, render: impl Fn(T) -> String) -> String
where
    R: Row,
    T: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    usize: sqlx::ColumnIndex<R>,
{
    row.try_get::<T, _>(index).map(render).unwrap_or_default()
}
