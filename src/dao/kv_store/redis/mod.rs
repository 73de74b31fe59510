//! Redis-backed [`KvStore`](super::KvStore) for deployments sharing state across processes.

mod config;
mod error;
mod store;

use crate::dao::storage::StorageError;

pub use config::RedisConfig;
pub use error::{RedisDaoError, RedisResult};
pub use store::RedisStore;

impl From<RedisDaoError> for StorageError {
    fn from(err: RedisDaoError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}
