use std::{sync::LazyLock, time::Duration};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use redis::{Client, Script, aio::ConnectionManager};

use crate::dao::{
    kv_store::{Batch, Command, FieldRemoval, HashCondition, KvStore},
    storage::StorageResult,
};

use super::{
    config::RedisConfig,
    error::{RedisDaoError, RedisResult},
};

/// Replays the batch flattened into `ARGV` from index `from`: each command is its
/// argument count followed by the arguments.
const BATCH_RUNNER: &str = r#"
local function run_batch(from)
  local i = from
  while i <= #ARGV do
    local n = tonumber(ARGV[i])
    redis.call(unpack(ARGV, i + 1, i + n))
    i = i + n + 1
  end
end
"#;

static DELETE_IF_EQUALS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

static HSET_IF: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local present
if ARGV[3] == 'field' then
  present = redis.call('HEXISTS', KEYS[1], ARGV[1])
else
  present = redis.call('EXISTS', KEYS[1])
end
if present == 0 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"#,
    )
});

static EXEC: LazyLock<Script> = LazyLock::new(|| {
    Script::new(&format!(
        r#"{BATCH_RUNNER}
run_batch(1)
return 1
"#
    ))
});

static EXEC_IF_ABSENT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(&format!(
        r#"{BATCH_RUNNER}
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
run_batch(1)
return 1
"#
    ))
});

static HDEL_CASCADE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(&format!(
        r#"{BATCH_RUNNER}
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
  return {{0, 0}}
end
if redis.call('EXISTS', KEYS[1]) == 1 then
  return {{1, 0}}
end
run_batch(2)
return {{1, 1}}
"#
    ))
});

/// [`KvStore`] over a shared Redis server.
///
/// Conditional writes and batches run as Lua scripts, so each call is atomic
/// against every other client of the same server. Hash field order is the one
/// Redis reports, which follows insertion order for the small hashes rooms use.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Open a managed connection to the configured server.
    pub async fn connect(config: RedisConfig) -> RedisResult<Self> {
        let client =
            Client::open(config.url).map_err(|source| RedisDaoError::InvalidUrl { source })?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|source| RedisDaoError::Connect { source })?;
        Ok(Self { connection })
    }

    fn query<T, F>(
        &self,
        command: &'static str,
        build: F,
    ) -> BoxFuture<'static, StorageResult<T>>
    where
        T: redis::FromRedisValue + Send + 'static,
        F: FnOnce() -> redis::Cmd,
    {
        let mut connection = self.connection.clone();
        let cmd = build();
        Box::pin(async move {
            let value: T = cmd
                .query_async(&mut connection)
                .await
                .map_err(|source| RedisDaoError::Command { command, source })?;
            Ok(value)
        })
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Flatten a batch into the argument layout read by [`BATCH_RUNNER`].
fn batch_args(batch: Batch) -> Vec<String> {
    let mut args = Vec::new();
    for command in batch.into_commands() {
        let words = match command {
            Command::Set { key, value, ttl } => match ttl {
                Some(ttl) => vec!["SET".into(), key, value, "PX".into(), millis(ttl).to_string()],
                None => vec!["SET".into(), key, value],
            },
            Command::HSet { key, field, value } => vec!["HSET".into(), key, field, value],
            Command::Expire { key, ttl } => vec!["PEXPIRE".into(), key, millis(ttl).to_string()],
            Command::Del { key } => vec!["DEL".into(), key],
            Command::RPush { key, value } => vec!["RPUSH".into(), key, value],
            Command::LTrim { key, keep_last: 0 } => vec!["DEL".into(), key],
            Command::LTrim { key, keep_last } => {
                vec!["LTRIM".into(), key, format!("-{keep_last}"), "-1".into()]
            }
        };
        args.push(words.len().to_string());
        args.extend(words);
    }
    args
}

/// Escape glob metacharacters so `prefix` matches literally in `KEYS`.
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

impl KvStore for RedisStore {
    fn exists(&self, key: String) -> BoxFuture<'static, StorageResult<bool>> {
        self.query("EXISTS", || {
            let mut cmd = redis::cmd("EXISTS");
            cmd.arg(key);
            cmd
        })
    }

    fn get(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.query("GET", || {
            let mut cmd = redis::cmd("GET");
            cmd.arg(key);
            cmd
        })
    }

    fn set(
        &self,
        key: String,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.query("SET", || {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            cmd
        })
    }

    fn take(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.query("GETDEL", || {
            let mut cmd = redis::cmd("GETDEL");
            cmd.arg(key);
            cmd
        })
    }

    fn delete_if_equals(
        &self,
        key: String,
        expected: String,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let mut connection = self.connection.clone();
        Box::pin(async move {
            let deleted: i64 = DELETE_IF_EQUALS
                .key(key)
                .arg(expected)
                .invoke_async(&mut connection)
                .await
                .map_err(|source| RedisDaoError::Command {
                    command: "delete_if_equals",
                    source,
                })?;
            Ok(deleted > 0)
        })
    }

    fn ttl(&self, key: String) -> BoxFuture<'static, StorageResult<Option<Duration>>> {
        let pttl = self.query::<i64, _>("PTTL", || {
            let mut cmd = redis::cmd("PTTL");
            cmd.arg(key);
            cmd
        });
        Box::pin(async move {
            // -2 for a missing key, -1 for a persistent one.
            let remaining = pttl.await?;
            Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
        })
    }

    fn hget(
        &self,
        key: String,
        field: String,
    ) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.query("HGET", || {
            let mut cmd = redis::cmd("HGET");
            cmd.arg(key).arg(field);
            cmd
        })
    }

    fn hgetall(&self, key: String) -> BoxFuture<'static, StorageResult<IndexMap<String, String>>> {
        let pairs = self.query::<Vec<(String, String)>, _>("HGETALL", || {
            let mut cmd = redis::cmd("HGETALL");
            cmd.arg(key);
            cmd
        });
        Box::pin(async move { Ok(pairs.await?.into_iter().collect()) })
    }

    fn hset_if(
        &self,
        key: String,
        field: String,
        value: String,
        condition: HashCondition,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let mut connection = self.connection.clone();
        let mode = match condition {
            HashCondition::KeyExists => "key",
            HashCondition::FieldExists => "field",
        };
        Box::pin(async move {
            let written: i64 = HSET_IF
                .key(key)
                .arg(field)
                .arg(value)
                .arg(mode)
                .invoke_async(&mut connection)
                .await
                .map_err(|source| RedisDaoError::Command {
                    command: "hset_if",
                    source,
                })?;
            Ok(written > 0)
        })
    }

    fn hdel(&self, key: String, field: String) -> BoxFuture<'static, StorageResult<bool>> {
        self.query("HDEL", || {
            let mut cmd = redis::cmd("HDEL");
            cmd.arg(key).arg(field);
            cmd
        })
    }

    fn lrange(&self, key: String) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        self.query("LRANGE", || {
            let mut cmd = redis::cmd("LRANGE");
            cmd.arg(key).arg(0).arg(-1);
            cmd
        })
    }

    fn keys(&self, prefix: String) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        self.query("KEYS", || {
            let mut cmd = redis::cmd("KEYS");
            cmd.arg(glob_prefix(&prefix));
            cmd
        })
    }

    fn exec(&self, batch: Batch) -> BoxFuture<'static, StorageResult<()>> {
        let mut connection = self.connection.clone();
        Box::pin(async move {
            if batch.is_empty() {
                return Ok(());
            }
            let _: i64 = EXEC
                .arg(batch_args(batch))
                .invoke_async(&mut connection)
                .await
                .map_err(|source| RedisDaoError::Command {
                    command: "exec",
                    source,
                })?;
            Ok(())
        })
    }

    fn exec_if_absent(&self, guard: String, batch: Batch) -> BoxFuture<'static, StorageResult<bool>> {
        let mut connection = self.connection.clone();
        Box::pin(async move {
            let ran: i64 = EXEC_IF_ABSENT
                .key(guard)
                .arg(batch_args(batch))
                .invoke_async(&mut connection)
                .await
                .map_err(|source| RedisDaoError::Command {
                    command: "exec_if_absent",
                    source,
                })?;
            Ok(ran > 0)
        })
    }

    fn hdel_cascade(
        &self,
        key: String,
        field: String,
        on_emptied: Batch,
    ) -> BoxFuture<'static, StorageResult<FieldRemoval>> {
        let mut connection = self.connection.clone();
        Box::pin(async move {
            let (removed, emptied): (i64, i64) = HDEL_CASCADE
                .key(key)
                .arg(field)
                .arg(batch_args(on_emptied))
                .invoke_async(&mut connection)
                .await
                .map_err(|source| RedisDaoError::Command {
                    command: "hdel_cascade",
                    source,
                })?;
            Ok(FieldRemoval {
                removed: removed > 0,
                emptied: emptied > 0,
            })
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let ping = self.query::<String, _>("PING", || redis::cmd("PING"));
        Box::pin(async move {
            ping.await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_flatten_with_argument_counts() {
        let batch = Batch::new()
            .push(Command::Set {
                key: "a".into(),
                value: "1".into(),
                ttl: Some(Duration::from_secs(2)),
            })
            .push(Command::Del { key: "b".into() })
            .push(Command::LTrim {
                key: "c".into(),
                keep_last: 50,
            });
        assert_eq!(
            batch_args(batch),
            vec!["5", "SET", "a", "1", "PX", "2000", "2", "DEL", "b", "4", "LTRIM", "c", "-50", "-1"]
        );
    }

    #[test]
    fn emptying_trim_becomes_a_delete() {
        let batch = Batch::new().push(Command::LTrim {
            key: "c".into(),
            keep_last: 0,
        });
        assert_eq!(batch_args(batch), vec!["2", "DEL", "c"]);
    }

    #[test]
    fn key_prefixes_match_literally() {
        assert_eq!(glob_prefix("room:"), "room:*");
        assert_eq!(glob_prefix("a*b?[c]"), r"a\*b\?\[c\]*");
    }
}
