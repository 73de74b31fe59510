/// Key-value store abstraction and its in-process backend.
pub mod kv_store;
/// Serialized record definitions.
pub mod models;
/// Typed room-scoped key layout over a [`kv_store::KvStore`].
pub mod room_store;
/// Storage error types.
pub mod storage;
