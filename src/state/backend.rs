//! Key/value backends for the state store.
//!
//! # Responsibilities
//! - Define the command surface the store needs from a clustered KV backend
//! - Provide an in-process backend with TTL expiry and all-or-nothing batches
//!
//! # Design Decisions
//! - Values are opaque strings (the store owns encoding)
//! - Expired entries are removed lazily on access and by `evict_expired`,
//!   which the store's health loop calls every tick
//! - A batch is validated against a staged overlay and only then committed

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::state::types::{BackendInfo, BatchReply, StateError, StateOp, StateResult};

/// Command surface of a key/value backend.
#[async_trait]
pub trait StoreBackend: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> StateResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StateResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> StateResult<bool>;

    async fn exists(&self, key: &str) -> StateResult<bool>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> StateResult<Vec<String>>;

    /// All fields of a hash value; empty when the key is absent.
    async fn get_fields(&self, key: &str) -> StateResult<HashMap<String, String>>;

    /// Apply `ops` as one unit. On error nothing is applied.
    async fn execute_batch(&self, ops: Vec<StateOp>) -> StateResult<Vec<BatchReply>>;

    async fn ping(&self) -> StateResult<()>;

    async fn info(&self) -> StateResult<BackendInfo>;

    /// Drop expired entries; returns how many were removed. Backends that
    /// expire keys on their own keep the default.
    async fn evict_expired(&self) -> StateResult<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Fields(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process backend.
///
/// Used for single-node deployments and tests. `set_available(false)` makes every
/// command fail with `Unavailable`, which simulates a backend outage.
#[derive(Debug)]
pub struct MemoryBackend {
    node_id: String,
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            node_id: format!("memory-{}", uuid::Uuid::new_v4()),
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Entries held in memory, expired ones included.
    pub fn stored_entries(&self) -> usize {
        self.entries.lock().expect("memory backend mutex poisoned").len()
    }

    fn ensure_available(&self) -> StateResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StateError::Unavailable(format!("{} is offline", self.node_id)))
        }
    }

    /// Read a live entry, evicting it if expired.
    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a Entry> {
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        entries.get(key)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one op to the staged overlay, falling back to the committed map for reads.
fn stage_op(
    committed: &HashMap<String, Entry>,
    staged: &mut HashMap<String, Option<Entry>>,
    op: StateOp,
    now: Instant,
) -> StateResult<BatchReply> {
    let current = |staged: &HashMap<String, Option<Entry>>, key: &str| -> Option<Entry> {
        match staged.get(key) {
            Some(slot) => slot.clone(),
            None => committed.get(key).filter(|e| !e.is_expired(now)).cloned(),
        }
    };

    match op {
        StateOp::Set { key, value, ttl } => {
            let entry = Entry {
                value: StoredValue::Text(value),
                expires_at: ttl.map(|ttl| now + ttl),
            };
            staged.insert(key, Some(entry));
            Ok(BatchReply::Stored)
        }
        StateOp::Delete { key } => {
            let existed = current(staged, &key).is_some();
            staged.insert(key, None);
            Ok(BatchReply::Deleted(existed))
        }
        StateOp::Increment { key, by } => {
            let (base, expires_at) = match current(staged, &key) {
                None => (0, None),
                Some(Entry {
                    value: StoredValue::Text(text),
                    expires_at,
                }) => {
                    let parsed = text
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| StateError::WrongType(key.clone()))?;
                    (parsed, expires_at)
                }
                Some(_) => return Err(StateError::WrongType(key)),
            };
            let next = base
                .checked_add(by)
                .ok_or_else(|| StateError::TransactionAborted(format!("increment overflow at '{}'", key)))?;
            staged.insert(
                key,
                Some(Entry {
                    value: StoredValue::Text(next.to_string()),
                    expires_at,
                }),
            );
            Ok(BatchReply::Integer(next))
        }
        StateOp::FieldSet { key, field, value } => {
            let (mut fields, expires_at) = match current(staged, &key) {
                None => (HashMap::new(), None),
                Some(Entry {
                    value: StoredValue::Fields(fields),
                    expires_at,
                }) => (fields, expires_at),
                Some(_) => return Err(StateError::WrongType(key)),
            };
            let created = fields.insert(field, value).is_none();
            staged.insert(
                key,
                Some(Entry {
                    value: StoredValue::Fields(fields),
                    expires_at,
                }),
            );
            Ok(BatchReply::FieldStored(created))
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().expect("memory backend mutex poisoned");
        match Self::live(&mut entries, key, Instant::now()) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(StateError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StateResult<()> {
        self.ensure_available()?;
        let entry = Entry {
            value: StoredValue::Text(value),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries
            .lock()
            .expect("memory backend mutex poisoned")
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().expect("memory backend mutex poisoned");
        let existed = Self::live(&mut entries, key, Instant::now()).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> StateResult<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().expect("memory backend mutex poisoned");
        Ok(Self::live(&mut entries, key, Instant::now()).is_some())
    }

    async fn keys(&self, prefix: &str) -> StateResult<Vec<String>> {
        self.ensure_available()?;
        let now = Instant::now();
        let entries = self.entries.lock().expect("memory backend mutex poisoned");
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_fields(&self, key: &str) -> StateResult<HashMap<String, String>> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().expect("memory backend mutex poisoned");
        match Self::live(&mut entries, key, Instant::now()) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: StoredValue::Fields(fields),
                ..
            }) => Ok(fields.clone()),
            Some(_) => Err(StateError::WrongType(key.to_string())),
        }
    }

    async fn execute_batch(&self, ops: Vec<StateOp>) -> StateResult<Vec<BatchReply>> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("memory backend mutex poisoned");

        let mut staged: HashMap<String, Option<Entry>> = HashMap::new();
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let key = op.key().to_string();
            let reply = stage_op(&entries, &mut staged, op, now)
                .map_err(|e| StateError::TransactionAborted(format!("'{}': {}", key, e)))?;
            replies.push(reply);
        }

        for (key, slot) in staged {
            match slot {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(replies)
    }

    async fn ping(&self) -> StateResult<()> {
        self.ensure_available()
    }

    async fn info(&self) -> StateResult<BackendInfo> {
        self.ensure_available()?;
        let now = Instant::now();
        let keys = self
            .entries
            .lock()
            .expect("memory backend mutex poisoned")
            .values()
            .filter(|e| !e.is_expired(now))
            .count();
        Ok(BackendInfo {
            backend: "memory".to_string(),
            node_id: self.node_id.clone(),
            mode: "standalone".to_string(),
            nodes: 1,
            keys,
        })
    }

    async fn evict_expired(&self) -> StateResult<usize> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("memory backend mutex poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }
}
