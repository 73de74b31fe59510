pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;
#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::dao::storage::StorageResult;

/// Precondition attached to a conditional hash write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCondition {
    /// Write only when the hash key itself exists.
    KeyExists,
    /// Write only when the field is already present in the hash.
    FieldExists,
}

/// Outcome of [`KvStore::hdel_cascade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldRemoval {
    /// The field was present and has been removed.
    pub removed: bool,
    /// Removing the field emptied the hash, so the follow-up batch ran.
    pub emptied: bool,
}

/// Single write executed as part of an atomic [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a string value, replacing any previous value and expiry.
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    /// Write a hash field, keeping the key's current expiry.
    HSet {
        key: String,
        field: String,
        value: String,
    },
    /// Set the expiry of an existing key. Missing keys are ignored.
    Expire { key: String, ttl: Duration },
    /// Remove a key of any kind.
    Del { key: String },
    /// Append to the tail of a list, creating it when missing.
    RPush { key: String, value: String },
    /// Keep only the most recent `keep_last` entries of a list.
    LTrim { key: String, keep_last: usize },
}

/// Ordered group of writes applied atomically relative to every other store call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    /// Start an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command to the batch.
    pub fn push(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Whether the batch holds no command.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Consume the batch, yielding its commands in order.
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

impl Extend<Command> for Batch {
    fn extend<T: IntoIterator<Item = Command>>(&mut self, iter: T) {
        self.commands.extend(iter);
    }
}

/// Abstraction over the external key-value store holding every room's state.
///
/// The command set mirrors a Redis subset: strings, insertion-ordered hashes and
/// lists, each with an optional per-key expiry. Removing the last field of a hash
/// or the last entry of a list removes the key.
pub trait KvStore: Send + Sync {
    fn exists(&self, key: String) -> BoxFuture<'static, StorageResult<bool>>;
    fn get(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>>;
    fn set(
        &self,
        key: String,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Atomically read and remove a string value.
    fn take(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>>;
    /// Atomically remove a string value if it still equals `expected`.
    fn delete_if_equals(
        &self,
        key: String,
        expected: String,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Remaining time to live, `None` when the key is missing or persistent.
    fn ttl(&self, key: String) -> BoxFuture<'static, StorageResult<Option<Duration>>>;
    fn hget(&self, key: String, field: String)
    -> BoxFuture<'static, StorageResult<Option<String>>>;
    fn hgetall(&self, key: String) -> BoxFuture<'static, StorageResult<IndexMap<String, String>>>;
    /// Write a hash field only when `condition` holds, returning whether it was written.
    fn hset_if(
        &self,
        key: String,
        field: String,
        value: String,
        condition: HashCondition,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    fn hdel(&self, key: String, field: String) -> BoxFuture<'static, StorageResult<bool>>;
    fn lrange(&self, key: String) -> BoxFuture<'static, StorageResult<Vec<String>>>;
    /// List live keys starting with `prefix`.
    fn keys(&self, prefix: String) -> BoxFuture<'static, StorageResult<Vec<String>>>;
    fn exec(&self, batch: Batch) -> BoxFuture<'static, StorageResult<()>>;
    /// Run `batch` atomically only while `guard` does not exist, returning whether it ran.
    fn exec_if_absent(&self, guard: String, batch: Batch) -> BoxFuture<'static, StorageResult<bool>>;
    /// Remove a hash field and, in the same atomic step, run `on_emptied` if that
    /// left the hash empty.
    fn hdel_cascade(
        &self,
        key: String,
        field: String,
        on_emptied: Batch,
    ) -> BoxFuture<'static, StorageResult<FieldRemoval>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
