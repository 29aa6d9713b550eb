//! Shared-store sliding-window backend over an ordered set.
//!
//! Each admission prunes aged entries, counts the remainder, and, when a
//! slot is free, adds the new timestamp and refreshes the key TTL. The
//! three steps run inside one server-side script so concurrent admissions
//! against the same key are atomic, and the count can never exceed the
//! limit even across replicas.

use std::time::Duration;

use anyhow::{Context, anyhow};
use redis::aio::ConnectionManager;
use redis::Script;

use super::Admission;
use crate::core::generate;

/// Prune, count, and conditionally add in one atomic invocation.
///
/// KEYS[1] bucket key; ARGV: exclusive prune bound, max, now, member tag,
/// window millis. Returns `{admitted, remaining, oldest}`.
const ADMIT_SCRIPT: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    redis.call('PEXPIRE', KEYS[1], ARGV[5])
    return {1, tonumber(ARGV[2]) - count - 1, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {0, 0, tonumber(oldest[2])}
";

/// The shared ordered-set backend.
pub struct SharedBackend {
    conn: ConnectionManager,
    script: Script,
    timeout: Duration,
}

impl SharedBackend {
    /// Connect to the store at `url`.
    ///
    /// # Errors
    ///
    /// Fails when the URL does not parse or the connection cannot be
    /// established.
    pub async fn connect(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid shared store URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("shared store connection failed")?;
        Ok(Self { conn, script: Script::new(ADMIT_SCRIPT), timeout })
    }

    /// Decide admission for `key` at `now` (Unix milliseconds).
    ///
    /// # Errors
    ///
    /// Any store or timeout failure; the caller degrades to the in-memory
    /// backend.
    pub async fn admit(
        &self, key: &str, now: i64, max: u32, window_ms: i64,
    ) -> anyhow::Result<Admission> {
        let prune_below = format!("({}", now - window_ms);
        let tag = generate::unique_tag(now);

        let mut conn = self.conn.clone();
        let invocation = async {
            let reply: Vec<i64> = self
                .script
                .key(key)
                .arg(prune_below)
                .arg(max)
                .arg(now)
                .arg(tag)
                .arg(window_ms)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, redis::RedisError>(reply)
        };
        let reply = tokio::time::timeout(self.timeout, invocation)
            .await
            .map_err(|_| anyhow!("shared store call exceeded {:?}", self.timeout))?
            .context("admission script failed")?;

        match reply.as_slice() {
            [1, remaining, _] => Ok(Admission::Admitted {
                remaining: u32::try_from(*remaining).unwrap_or(0),
            }),
            [0, _, oldest] => Ok(Admission::Denied { remaining: 0, reset_at: oldest + window_ms }),
            other => Err(anyhow!("unexpected admission script reply: {other:?}")),
        }
    }
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}
