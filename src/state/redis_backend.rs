//! Redis backend for the state store.
//!
//! # Responsibilities
//! - Map the store command surface onto Redis commands over one managed connection
//! - Keep batches all-or-nothing on top of MULTI/EXEC
//!
//! # Design Decisions
//! - `ConnectionManager` reconnects on its own; a dropped link surfaces as
//!   `Unavailable` and the store's health loop flips to degraded mode
//! - Expiry is left to Redis, so `evict_expired` keeps the trait default
//! - EXEC does not roll back commands that fail at run time, so a batch is
//!   checked against the current key types first and rejected before anything
//!   is sent. A concurrent writer changing a key type in between can still
//!   cause a partial apply.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError};

use crate::state::backend::StoreBackend;
use crate::state::types::{BackendInfo, BatchReply, StateError, StateOp, StateResult};

const SCAN_BATCH: usize = 500;

/// Store backend talking to a Redis server or cluster proxy.
#[derive(Clone)]
pub struct RedisBackend {
    endpoint: String,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Open a managed connection to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> StateResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StateError::Unavailable(format!("invalid redis url '{}': {}", url, e)))?;
        let endpoint = client.get_connection_info().addr.to_string();
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| map_error("connect", e))?;
        tracing::info!(endpoint = %endpoint, "Connected to redis");
        Ok(Self { endpoint, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Current shape of `key` on the server, as far as a batch cares.
    async fn server_shape(&self, key: &str) -> StateResult<Staged> {
        let mut conn = self.conn();
        let kind: String = redis::cmd("TYPE")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error(key, e))?;
        match kind.as_str() {
            "none" => Ok(Staged::Absent),
            "hash" => Ok(Staged::Fields),
            "string" => {
                let raw: Option<String> = redis::cmd("GET")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_error(key, e))?;
                Ok(Staged::Text(raw.and_then(|v| v.trim().parse().ok())))
            }
            _ => Ok(Staged::Other),
        }
    }

    /// Reject a batch that would fail half-way inside EXEC.
    async fn check_batch(&self, ops: &[StateOp]) -> StateResult<()> {
        let mut staged: HashMap<String, Staged> = HashMap::new();
        for op in ops {
            let key = op.key();
            if !staged.contains_key(key) {
                let shape = match op {
                    StateOp::Increment { .. } | StateOp::FieldSet { .. } => {
                        self.server_shape(key).await?
                    }
                    StateOp::Set { .. } | StateOp::Delete { .. } => Staged::Absent,
                };
                staged.insert(key.to_string(), shape);
            }
            stage(&mut staged, op)?;
        }
        Ok(())
    }
}

/// What a batch knows about a key while it is being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staged {
    Absent,
    /// String value, with its integer reading when it has one.
    Text(Option<i64>),
    Fields,
    /// Lists, sets and other types the store never writes.
    Other,
}

/// Apply `op` to the staged view, failing the way EXEC would.
fn stage(staged: &mut HashMap<String, Staged>, op: &StateOp) -> StateResult<()> {
    let key = op.key();
    let abort = |reason: &str| StateError::TransactionAborted(format!("'{}': {}", key, reason));
    let current = staged.get(key).copied().unwrap_or(Staged::Absent);
    let next = match op {
        StateOp::Set { value, .. } => Staged::Text(value.trim().parse().ok()),
        StateOp::Delete { .. } => Staged::Absent,
        StateOp::Increment { by, .. } => {
            let base = match current {
                Staged::Absent => 0,
                Staged::Text(Some(n)) => n,
                _ => return Err(abort("value is not an integer")),
            };
            let next = base
                .checked_add(*by)
                .ok_or_else(|| abort("increment overflow"))?;
            Staged::Text(Some(next))
        }
        StateOp::FieldSet { .. } => match current {
            Staged::Absent | Staged::Fields => Staged::Fields,
            _ => return Err(abort("value is not a hash")),
        },
    };
    staged.insert(key.to_string(), next);
    Ok(())
}

/// Escape glob metacharacters so `prefix` matches literally in SCAN MATCH.
fn glob_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// Pull `field` out of an INFO section.
fn info_field<'a>(info: &'a str, field: &str) -> Option<&'a str> {
    info.lines()
        .filter_map(|line| line.trim_end().split_once(':'))
        .find(|(name, _)| *name == field)
        .map(|(_, value)| value)
}

fn map_error(key: &str, e: RedisError) -> StateError {
    if e.code() == Some("WRONGTYPE") {
        return StateError::WrongType(key.to_string());
    }
    if e.kind() == ErrorKind::TypeError {
        return StateError::Serialization(e.to_string());
    }
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        return StateError::Unavailable(format!("redis: {}", e));
    }
    StateError::Unavailable(format!("redis command failed on '{}': {}", key, e))
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StateResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StateResult<bool> {
        let found: u64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(found > 0)
    }

    async fn keys(&self, prefix: &str) -> StateResult<Vec<String>> {
        let pattern = glob_prefix(prefix);
        let mut conn = self.conn();
        let mut found = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_error(prefix, e))?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(found.into_iter().collect())
    }

    async fn get_fields(&self, key: &str) -> StateResult<HashMap<String, String>> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(fields)
    }

    async fn execute_batch(&self, ops: Vec<StateOp>) -> StateResult<Vec<BatchReply>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        self.check_batch(&ops).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                StateOp::Set { key, value, ttl } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl {
                        cmd.arg("PX").arg(ttl_millis(*ttl));
                    }
                }
                StateOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                StateOp::Increment { key, by } => {
                    pipe.cmd("INCRBY").arg(key).arg(*by);
                }
                StateOp::FieldSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value);
                }
            }
        }

        let first_key = ops[0].key().to_string();
        let values: Vec<redis::Value> = pipe
            .query_async(&mut self.conn())
            .await
            .map_err(|e| StateError::TransactionAborted(map_error(&first_key, e).to_string()))?;
        if values.len() != ops.len() {
            return Err(StateError::TransactionAborted(format!(
                "expected {} replies, got {}",
                ops.len(),
                values.len()
            )));
        }

        ops.iter()
            .zip(values.iter())
            .map(|(op, value)| {
                let reply = match op {
                    StateOp::Set { .. } => Ok(BatchReply::Stored),
                    StateOp::Delete { .. } => {
                        redis::from_redis_value::<i64>(value).map(|n| BatchReply::Deleted(n > 0))
                    }
                    StateOp::Increment { .. } => {
                        redis::from_redis_value::<i64>(value).map(BatchReply::Integer)
                    }
                    StateOp::FieldSet { .. } => {
                        redis::from_redis_value::<i64>(value).map(|n| BatchReply::FieldStored(n > 0))
                    }
                };
                reply.map_err(|e| map_error(op.key(), e))
            })
            .collect()
    }

    async fn ping(&self) -> StateResult<()> {
        let reply: String = redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_error("ping", e))?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StateError::Unavailable(format!("unexpected ping reply '{}'", reply)))
        }
    }

    async fn info(&self) -> StateResult<BackendInfo> {
        let mut conn = self.conn();
        let server: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("info", e))?;
        let keys: usize = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("dbsize", e))?;

        let mode = info_field(&server, "redis_mode").unwrap_or("standalone").to_string();
        let nodes = if mode == "cluster" {
            let listing: Result<String, RedisError> =
                redis::cmd("CLUSTER").arg("NODES").query_async(&mut conn).await;
            listing
                .map(|l| l.lines().filter(|line| !line.trim().is_empty()).count())
                .unwrap_or(1)
                .max(1)
        } else {
            1
        };
        let node_id = info_field(&server, "run_id")
            .map(|id| format!("{}/{}", self.endpoint, id))
            .unwrap_or_else(|| self.endpoint.clone());

        Ok(BackendInfo {
            backend: "redis".to_string(),
            node_id,
            mode,
            nodes,
            keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_prefix_escapes_metacharacters() {
        assert_eq!(glob_prefix("app:circuit_breaker:"), "app:circuit_breaker:*");
        assert_eq!(glob_prefix("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
    }

    #[test]
    fn test_info_field() {
        let info = "# Server\r\nredis_version:7.2.4\r\nredis_mode:cluster\r\nrun_id:abc123\r\n";
        assert_eq!(info_field(info, "redis_mode"), Some("cluster"));
        assert_eq!(info_field(info, "run_id"), Some("abc123"));
        assert_eq!(info_field(info, "uptime"), None);
    }

    #[test]
    fn test_error_mapping() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(map_error("k", io), StateError::Unavailable(_)));

        let decode = RedisError::from((ErrorKind::TypeError, "not a number"));
        assert!(matches!(map_error("k", decode), StateError::Serialization(_)));
    }

    #[test]
    fn test_ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2_000);
    }

    #[test]
    fn test_staged_batch_follows_earlier_ops() {
        let mut staged = HashMap::new();
        for op in [
            StateOp::Set {
                key: "n".into(),
                value: "41".into(),
                ttl: None,
            },
            StateOp::increment("n", 1),
            StateOp::field_set("h", "f", "1"),
            StateOp::delete("h"),
            StateOp::increment("h", 2),
        ] {
            stage(&mut staged, &op).unwrap();
        }
        assert_eq!(staged["n"], Staged::Text(Some(42)));
        assert_eq!(staged["h"], Staged::Text(Some(2)));
    }

    #[test]
    fn test_staged_batch_rejects_type_clash() {
        let mut staged = HashMap::new();
        staged.insert("name".to_string(), Staged::Text(None));
        staged.insert("list".to_string(), Staged::Other);

        let err = stage(&mut staged, &StateOp::increment("name", 1)).unwrap_err();
        assert!(matches!(&err, StateError::TransactionAborted(r) if r.contains("'name'")));
        assert!(stage(&mut staged, &StateOp::field_set("list", "f", "v")).is_err());

        staged.insert("max".to_string(), Staged::Text(Some(i64::MAX)));
        assert!(stage(&mut staged, &StateOp::increment("max", 1)).is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let err = RedisBackend::connect("not a url").await.unwrap_err();
        assert!(matches!(err, StateError::Unavailable(reason) if reason.contains("invalid redis url")));
    }
}
