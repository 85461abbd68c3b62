//! Redis implementation of the key-value seam
//!
//! Each call clones the shared `ConnectionManager` and runs under the
//! configured deadline. The rename used by route updates and legacy key
//! migration runs as a Lua script so Redis executes it as one command.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::kv::{KeyKind, KvBackend, ReplaceOutcome};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// KEYS[1] old, KEYS[2] new, ARGV[1] value; -1 old missing, 0 new taken, 1 done
const REPLACE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
if KEYS[1] ~= KEYS[2] and redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
redis.call('DEL', KEYS[1])
redis.call('SET', KEYS[2], ARGV[1])
return 1
"#;

const RENAME_NX_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
redis.call('RENAME', KEYS[1], KEYS[2])
return 1
"#;

/// Keys requested per SCAN round trip
const SCAN_COUNT: usize = 500;

pub struct RedisBackend {
    conn: ConnectionManager,
    timeout: Duration,
    replace_script: Script,
    rename_nx_script: Script,
}

impl RedisBackend {
    /// Connect to the configured database and verify it answers PING
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config.url();
        let timeout = config.timeout();
        let client = Client::open(url.as_str())?;

        let conn = match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "connect",
                    after: timeout,
                })
            }
        };

        let backend = Self {
            conn,
            timeout,
            replace_script: Script::new(REPLACE_SCRIPT),
            rename_nx_script: Script::new(RENAME_NX_SCRIPT),
        };
        backend.ping().await?;

        info!(host = %config.host, port = config.port, db = config.db, "Connected to Redis");
        Ok(backend)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .run("PING", async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.run("GET", async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run("SET", async move { conn.set::<_, _, ()>(key, value).await })
            .await
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.run("SETNX", async move { conn.set_nx::<_, _, bool>(key, value).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .run("DEL", async move { conn.del(key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let mut conn = self.conn.clone();
            let (next, batch): (u64, Vec<String>) = self
                .run("SCAN", async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may report a key more than once
        keys.sort();
        keys.dedup();
        debug!(pattern, count = keys.len(), "Scanned keys");
        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        self.run("MGET", async move {
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await
        })
        .await
    }

    async fn key_kind(&self, key: &str) -> Result<KeyKind> {
        let mut conn = self.conn.clone();
        let name: String = self
            .run("TYPE", async move {
                redis::cmd("TYPE").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(KeyKind::from_type_name(&name))
    }

    async fn hash_entries(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        self.run("HGETALL", async move {
            conn.hgetall::<_, Vec<(String, String)>>(key).await
        })
        .await
    }

    async fn replace(&self, old_key: &str, new_key: &str, value: &str) -> Result<ReplaceOutcome> {
        let mut conn = self.conn.clone();
        let script = &self.replace_script;
        let code: i64 = self
            .run("EVALSHA replace", async move {
                script
                    .key(old_key)
                    .key(new_key)
                    .arg(value)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        match code {
            1 => Ok(ReplaceOutcome::Replaced),
            0 => Ok(ReplaceOutcome::TargetExists),
            -1 => Ok(ReplaceOutcome::SourceMissing),
            other => Err(Error::Decode(format!(
                "unexpected replace script result {}",
                other
            ))),
        }
    }

    async fn rename_nx(&self, old_key: &str, new_key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = &self.rename_nx_script;
        let moved: i64 = self
            .run("EVALSHA rename_nx", async move {
                script.key(old_key).key(new_key).invoke_async(&mut conn).await
            })
            .await?;
        Ok(moved == 1)
    }
}
