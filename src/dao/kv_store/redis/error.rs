//! Error types raised by the Redis storage implementation.

use thiserror::Error;

/// Convenient result alias returning [`RedisDaoError`] failures.
pub type RedisResult<T> = Result<T, RedisDaoError>;

/// Failures that can occur while talking to Redis.
#[derive(Debug, Error)]
pub enum RedisDaoError {
    /// Required environment variable is missing.
    #[error("missing Redis environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// The connection URL could not be parsed.
    #[error("invalid Redis URL")]
    InvalidUrl {
        #[source]
        source: redis::RedisError,
    },
    /// The connection manager could not reach the server.
    #[error("failed to connect to Redis")]
    Connect {
        #[source]
        source: redis::RedisError,
    },
    /// A command or script was rejected or the connection dropped mid-call.
    #[error("Redis `{command}` failed")]
    Command {
        command: &'static str,
        #[source]
        source: redis::RedisError,
    },
}
