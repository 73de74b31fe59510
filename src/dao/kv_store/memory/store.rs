use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use tokio::{sync::Mutex, time::Instant};

use crate::dao::{
    kv_store::{Batch, Command, FieldRemoval, HashCondition, KvStore},
    storage::{StorageError, StorageResult},
};

/// Key-value store living inside the process, with lazy per-key expiry.
///
/// Every call takes the same lock, which makes a [`Batch`] atomic with respect to
/// any other reader or writer. Expiry follows the Tokio clock so paused-time tests
/// can fast-forward TTLs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(IndexMap<String, String>),
    List(VecDeque<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
        }
    }
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

fn wrong_type(key: &str, expected: &'static str, entry: &Entry) -> StorageError {
    StorageError::WrongType {
        key: key.to_string(),
        expected,
        actual: entry.value.kind(),
    }
}

/// Return the live entry for `key`, dropping it first when it has expired.
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if map.get(key).is_some_and(|entry| entry.is_expired(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn read_str(map: &mut HashMap<String, Entry>, key: &str) -> StorageResult<Option<String>> {
    match live(map, key) {
        None => Ok(None),
        Some(Entry {
            value: Value::Str(value),
            ..
        }) => Ok(Some(value.clone())),
        Some(other) => Err(wrong_type(key, "string", other)),
    }
}

fn hash_mut<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> StorageResult<Option<&'a mut IndexMap<String, String>>> {
    match live(map, key) {
        None => Ok(None),
        Some(Entry {
            value: Value::Hash(hash),
            ..
        }) => Ok(Some(hash)),
        Some(other) => Err(wrong_type(key, "hash", other)),
    }
}

fn list_mut<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> StorageResult<Option<&'a mut VecDeque<String>>> {
    match live(map, key) {
        None => Ok(None),
        Some(Entry {
            value: Value::List(list),
            ..
        }) => Ok(Some(list)),
        Some(other) => Err(wrong_type(key, "list", other)),
    }
}

/// Validate then apply every command of a batch.
fn run_batch(map: &mut HashMap<String, Entry>, batch: Batch) -> StorageResult<()> {
    let commands = batch.into_commands();
    check_batch(map, &commands)?;
    commands
        .into_iter()
        .try_for_each(|command| apply(map, command))
}

fn apply(map: &mut HashMap<String, Entry>, command: Command) -> StorageResult<()> {
    match command {
        Command::Set { key, value, ttl } => {
            map.insert(
                key,
                Entry {
                    value: Value::Str(value),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        }
        Command::HSet { key, field, value } => match hash_mut(map, &key)? {
            Some(hash) => {
                hash.insert(field, value);
            }
            None => {
                let mut hash = IndexMap::new();
                hash.insert(field, value);
                map.insert(
                    key,
                    Entry {
                        value: Value::Hash(hash),
                        expires_at: None,
                    },
                );
            }
        },
        Command::Expire { key, ttl } => {
            if let Some(entry) = live(map, &key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        Command::Del { key } => {
            map.remove(&key);
        }
        Command::RPush { key, value } => match list_mut(map, &key)? {
            Some(list) => list.push_back(value),
            None => {
                map.insert(
                    key,
                    Entry {
                        value: Value::List(VecDeque::from([value])),
                        expires_at: None,
                    },
                );
            }
        },
        Command::LTrim { key, keep_last } => {
            let emptied = match list_mut(map, &key)? {
                Some(list) => {
                    let excess = list.len().saturating_sub(keep_last);
                    list.drain(..excess);
                    list.is_empty()
                }
                None => false,
            };
            if emptied {
                map.remove(&key);
            }
        }
    }
    Ok(())
}

/// Validate every command against the current key kinds before mutating anything,
/// so a failing batch leaves the store untouched.
fn check_batch(map: &mut HashMap<String, Entry>, commands: &[Command]) -> StorageResult<()> {
    let mut shadow: HashMap<&str, &'static str> = HashMap::new();
    for command in commands {
        let (key, expected) = match command {
            Command::HSet { key, .. } => (key.as_str(), Some("hash")),
            Command::RPush { key, .. } | Command::LTrim { key, .. } => (key.as_str(), Some("list")),
            Command::Set { key, .. } => {
                shadow.insert(key.as_str(), "string");
                continue;
            }
            Command::Del { key } => {
                shadow.insert(key.as_str(), "none");
                continue;
            }
            Command::Expire { .. } => ("", None),
        };
        let Some(expected) = expected else {
            continue;
        };
        let actual = match shadow.get(key) {
            Some(kind) => *kind,
            None => live(map, key).map_or("none", |entry| entry.value.kind()),
        };
        if actual != "none" && actual != expected {
            return Err(StorageError::WrongType {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        shadow.insert(key, expected);
    }
    Ok(())
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn run<T, F>(&self, op: F) -> BoxFuture<'static, StorageResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut HashMap<String, Entry>) -> StorageResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut guard = inner.lock().await;
            op(&mut *guard)
        })
    }
}

impl KvStore for MemoryStore {
    fn exists(&self, key: String) -> BoxFuture<'static, StorageResult<bool>> {
        self.run(move |map| Ok(live(map, &key).is_some()))
    }

    fn get(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.run(move |map| read_str(map, &key))
    }

    fn set(
        &self,
        key: String,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.run(move |map| apply(map, Command::Set { key, value, ttl }))
    }

    fn take(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.run(move |map| {
            let value = read_str(map, &key)?;
            if value.is_some() {
                map.remove(&key);
            }
            Ok(value)
        })
    }

    fn delete_if_equals(
        &self,
        key: String,
        expected: String,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.run(move |map| {
            if read_str(map, &key)?.as_deref() == Some(expected.as_str()) {
                map.remove(&key);
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    fn ttl(&self, key: String) -> BoxFuture<'static, StorageResult<Option<Duration>>> {
        self.run(move |map| {
            let now = Instant::now();
            Ok(live(map, &key)
                .and_then(|entry| entry.expires_at)
                .map(|deadline| deadline.saturating_duration_since(now)))
        })
    }

    fn hget(
        &self,
        key: String,
        field: String,
    ) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.run(move |map| Ok(hash_mut(map, &key)?.and_then(|hash| hash.get(&field).cloned())))
    }

    fn hgetall(&self, key: String) -> BoxFuture<'static, StorageResult<IndexMap<String, String>>> {
        self.run(move |map| Ok(hash_mut(map, &key)?.cloned().unwrap_or_default()))
    }

    fn hset_if(
        &self,
        key: String,
        field: String,
        value: String,
        condition: HashCondition,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.run(move |map| {
            let Some(hash) = hash_mut(map, &key)? else {
                return Ok(false);
            };
            if condition == HashCondition::FieldExists && !hash.contains_key(&field) {
                return Ok(false);
            }
            hash.insert(field, value);
            Ok(true)
        })
    }

    fn hdel(&self, key: String, field: String) -> BoxFuture<'static, StorageResult<bool>> {
        self.run(move |map| {
            let (removed, emptied) = match hash_mut(map, &key)? {
                Some(hash) => (hash.shift_remove(&field).is_some(), hash.is_empty()),
                None => (false, false),
            };
            if emptied {
                map.remove(&key);
            }
            Ok(removed)
        })
    }

    fn lrange(&self, key: String) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        self.run(move |map| {
            Ok(list_mut(map, &key)?
                .map(|list| list.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn keys(&self, prefix: String) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        self.run(move |map| {
            let now = Instant::now();
            map.retain(|_, entry| !entry.is_expired(now));
            Ok(map
                .keys()
                .filter(|key| key.starts_with(&prefix))
                .cloned()
                .collect())
        })
    }

    fn exec(&self, batch: Batch) -> BoxFuture<'static, StorageResult<()>> {
        self.run(move |map| run_batch(map, batch))
    }

    fn exec_if_absent(&self, guard: String, batch: Batch) -> BoxFuture<'static, StorageResult<bool>> {
        self.run(move |map| {
            if live(map, &guard).is_some() {
                return Ok(false);
            }
            run_batch(map, batch)?;
            Ok(true)
        })
    }

    fn hdel_cascade(
        &self,
        key: String,
        field: String,
        on_emptied: Batch,
    ) -> BoxFuture<'static, StorageResult<FieldRemoval>> {
        self.run(move |map| {
            let removed = match hash_mut(map, &key)? {
                Some(hash) => hash.shift_remove(&field).is_some(),
                None => return Ok(FieldRemoval::default()),
            };
            if hash_mut(map, &key)?.is_some_and(|hash| !hash.is_empty()) {
                return Ok(FieldRemoval {
                    removed,
                    emptied: false,
                });
            }
            map.remove(&key);
            run_batch(map, on_emptied)?;
            Ok(FieldRemoval {
                removed,
                emptied: true,
            })
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
