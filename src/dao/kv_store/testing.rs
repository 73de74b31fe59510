//! Store doubles for unit tests.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::dao::{
    kv_store::{Batch, FieldRemoval, HashCondition, KvStore, memory::MemoryStore},
    storage::{StorageError, StorageResult},
};

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

/// [`MemoryStore`] that behaves like a remote store: every call yields to the
/// scheduler before reaching the data, and reads or writes can be made to fail.
#[derive(Clone, Default)]
pub struct TestStore {
    inner: MemoryStore,
    yields: usize,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend `yields` times before every call.
    pub fn with_yields(mut self, yields: usize) -> Self {
        self.yields = yields;
        self
    }

    pub fn fail_reads(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn wrap<T: Send + 'static>(
        &self,
        access: Access,
        op: BoxFuture<'static, StorageResult<T>>,
    ) -> BoxFuture<'static, StorageResult<T>> {
        let yields = self.yields;
        let failing = match access {
            Access::Read => Arc::clone(&self.fail_reads),
            Access::Write => Arc::clone(&self.fail_writes),
        };
        Box::pin(async move {
            for _ in 0..yields {
                tokio::task::yield_now().await;
            }
            if failing.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable {
                    message: "store offline".into(),
                    source: Box::new(io::Error::other("connection refused")),
                });
            }
            op.await
        })
    }
}

impl KvStore for TestStore {
    fn exists(&self, key: String) -> BoxFuture<'static, StorageResult<bool>> {
        self.wrap(Access::Read, self.inner.exists(key))
    }

    fn get(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.wrap(Access::Read, self.inner.get(key))
    }

    fn set(
        &self,
        key: String,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.wrap(Access::Write, self.inner.set(key, value, ttl))
    }

    fn take(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.wrap(Access::Write, self.inner.take(key))
    }

    fn delete_if_equals(
        &self,
        key: String,
        expected: String,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.wrap(Access::Write, self.inner.delete_if_equals(key, expected))
    }

    fn ttl(&self, key: String) -> BoxFuture<'static, StorageResult<Option<Duration>>> {
        self.wrap(Access::Read, self.inner.ttl(key))
    }

    fn hget(
        &self,
        key: String,
        field: String,
    ) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.wrap(Access::Read, self.inner.hget(key, field))
    }

    fn hgetall(&self, key: String) -> BoxFuture<'static, StorageResult<IndexMap<String, String>>> {
        self.wrap(Access::Read, self.inner.hgetall(key))
    }

    fn hset_if(
        &self,
        key: String,
        field: String,
        value: String,
        condition: HashCondition,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.wrap(
            Access::Write,
            self.inner.hset_if(key, field, value, condition),
        )
    }

    fn hdel(&self, key: String, field: String) -> BoxFuture<'static, StorageResult<bool>> {
        self.wrap(Access::Write, self.inner.hdel(key, field))
    }

    fn lrange(&self, key: String) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        self.wrap(Access::Read, self.inner.lrange(key))
    }

    fn keys(&self, prefix: String) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        self.wrap(Access::Read, self.inner.keys(prefix))
    }

    fn exec(&self, batch: Batch) -> BoxFuture<'static, StorageResult<()>> {
        self.wrap(Access::Write, self.inner.exec(batch))
    }

    fn exec_if_absent(&self, guard: String, batch: Batch) -> BoxFuture<'static, StorageResult<bool>> {
        self.wrap(Access::Write, self.inner.exec_if_absent(guard, batch))
    }

    fn hdel_cascade(
        &self,
        key: String,
        field: String,
        on_emptied: Batch,
    ) -> BoxFuture<'static, StorageResult<FieldRemoval>> {
        self.wrap(
            Access::Write,
            self.inner.hdel_cascade(key, field, on_emptied),
        )
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.wrap(Access::Read, self.inner.health_check())
    }
}
