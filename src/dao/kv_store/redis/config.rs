use super::error::{RedisDaoError, RedisResult};

/// Runtime configuration describing how to reach Redis.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://localhost:6379/0`.
    pub url: String,
}

impl RedisConfig {
    /// Construct a configuration from an explicit connection URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Build a configuration from `REDIS_URL`.
    pub fn from_env() -> RedisResult<Self> {
        std::env::var("REDIS_URL")
            .map(Self::new)
            .map_err(|_| RedisDaoError::MissingEnvVar { var: "REDIS_URL" })
    }
}
