//! In-process TTL store implementing [`KvStore`](super::KvStore).

mod store;

pub use store::MemoryStore;
