use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::Result;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Redis-backed store
// ---------------------------------------------------------------------------

/// [`Store`] implementation over Redis.
///
/// Records live under their own key with a sibling `{key}:ver` counter; the
/// conditional write is a Lua script so the version check and the write are
/// one atomic round-trip.  Redis has no cross-request lock primitive suited
/// to read-modify-write over HTTP handlers, which is exactly why the roster
/// update above this layer is compare-and-retry rather than lock-based.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    insert_script: Script,
    cas_script: Script,
}

const INSERT_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
  redis.call('SET', KEYS[2], '1', 'EX', ARGV[2])
  return 1
end
return 0
"#;

const CAS_SCRIPT: &str = r#"
local ver = redis.call('GET', KEYS[2])
if not ver then ver = '0' end
if ver ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
redis.call('INCR', KEYS[2])
redis.call('EXPIRE', KEYS[2], ARGV[3])
return 1
"#;

fn version_key(key: &str) -> String {
    format!("{key}:ver")
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!(url = %url, "connected to Redis");
        Ok(Self {
            conn,
            insert_script: Script::new(INSERT_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn fetch(&self, key: &str) -> Result<Option<(String, u64)>> {
        let mut conn = self.conn.clone();
        let (value, version): (Option<String>, Option<u64>) = redis::pipe()
            .get(key)
            .get(version_key(key))
            .query_async(&mut conn)
            .await?;

        // A record whose version key lapsed independently reads as version 1;
        // the next CAS against it will miss and force a clean re-read.
        Ok(value.map(|v| (v, version.unwrap_or(1))))
    }

    async fn insert(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .insert_script
            .key(key)
            .key(version_key(key))
            .arg(value)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .key(version_key(key))
            .arg(expected.to_string())
            .arg(value)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![key.to_string(), version_key(key)]).await?;
        Ok(())
    }

    async fn append_log(&self, key: &str, entry: &str, cap: usize, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .rpush(key, entry)
            .ignore()
            .ltrim(key, -(cap as isize), -1)
            .ignore()
            .expire(key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn log_entries(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(entries)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1u64).await?;
        if count == 1 {
            conn.expire::<_, ()>(key, ttl_secs(window) as i64).await?;
        }
        Ok(count)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
