use super::{KvError, KvStore, ScanPage};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, ErrorKind, RedisError, RedisResult};
use std::{future::Future, time::Duration};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

// Servers older than 6.2 lack GETDEL.
const GET_AND_DELETE_SCRIPT: &str =
    "local v = redis.call('GET', KEYS[1]); if v then redis.call('DEL', KEYS[1]); end; return v";
const INCREMENT_WITH_TTL_SCRIPT: &str = "local n = redis.call('INCR', KEYS[1]); \
    if n == 1 then redis.call('PEXPIRE', KEYS[1], ARGV[1]); end; return n";

impl From<RedisError> for KvError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Redis-backed [`KvStore`].
///
/// The connection manager is created once, normally by [`RedisStore::connect`] during
/// startup. If that first attempt fails the store keeps answering with errors and retries
/// the connection on the next call.
pub struct RedisStore {
    client: Client,
    manager: OnceCell<ConnectionManager>,
    dial_timeout: Duration,
    op_timeout: Duration,
}

impl RedisStore {
    /// # Errors
    /// Returns an error if `url` is not a valid redis connection string.
    pub fn new(url: &str, dial_timeout: Duration, op_timeout: Duration) -> Result<Self, KvError> {
        let client = Client::open(url).map_err(KvError::from)?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
            dial_timeout,
            op_timeout,
        })
    }

    /// Establish the shared connection.
    ///
    /// # Errors
    /// Returns an error if the server cannot be reached within the dial timeout.
    pub async fn connect(&self) -> Result<(), KvError> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<ConnectionManager, KvError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                debug!("opening redis connection manager");
                match tokio::time::timeout(self.dial_timeout, self.client.get_connection_manager())
                    .await
                {
                    Ok(Ok(manager)) => Ok(manager),
                    Ok(Err(err)) => Err(KvError::from(err)),
                    Err(_) => Err(KvError::Timeout),
                }
            })
            .await?;
        Ok(manager.clone())
    }

    async fn run<T, F>(&self, fut: F) -> Result<T, KvError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(KvError::from),
            Err(_) => Err(KvError::Timeout),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters so `prefix` is matched literally by `SCAN MATCH`.
fn match_pattern(prefix: &str) -> String {
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

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = self.run(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(millis(ttl));
        let reply: Option<String> = self.run(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn increment(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(INCREMENT_WITH_TTL_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(millis(ttl));
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(millis(ttl));
        let applied: i64 = self.run(cmd.query_async(&mut conn)).await?;
        Ok(applied == 1)
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("GETDEL");
        cmd.arg(key);
        let first = tokio::time::timeout(self.op_timeout, cmd.query_async(&mut conn)).await;
        match first {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.kind() == ErrorKind::ResponseError => {
                debug!(error = %err, "GETDEL rejected, using script");
                let mut eval = redis::cmd("EVAL");
                eval.arg(GET_AND_DELETE_SCRIPT).arg(1).arg(key);
                self.run(eval.query_async(&mut conn)).await
            }
            Ok(Err(err)) => Err(KvError::from(err)),
            Err(_) => Err(KvError::Timeout),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let found: i64 = self.run(cmd.query_async(&mut conn)).await?;
        Ok(found > 0)
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<ScanPage, KvError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(match_pattern(prefix))
            .arg("COUNT")
            .arg(count.max(1));
        let (next_cursor, keys): (u64, Vec<String>) = self.run(cmd.query_async(&mut conn)).await?;
        Ok(ScanPage { keys, next_cursor })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, KvError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("DEL").arg(key);
        }
        let removed: Vec<u64> = self.run(pipe.query_async(&mut conn)).await?;
        Ok(removed.iter().sum())
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let cmd = redis::cmd("PING");
        let reply: String = self.run(cmd.query_async(&mut conn)).await?;
        if reply.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            warn!(reply, "unexpected PING reply");
            Err(KvError::Unavailable(format!("unexpected PING reply: {reply}")))
        }
    }
}
