use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{CoordError, CoordResult, CoordinationStore};

/// Redis 协调存储（多路复用连接）/ Redis-backed store over a multiplexed tokio connection
#[derive(Clone)]
pub struct RedisCoordStore {
    conn: MultiplexedConnection,
}

impl From<redis::RedisError> for CoordError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            CoordError::Unavailable(err.to_string())
        } else {
            CoordError::Protocol(err.to_string())
        }
    }
}

impl RedisCoordStore {
    pub async fn connect(url: &str) -> CoordResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { conn })
    }

    fn ms(d: Duration) -> u64 {
        d.as_millis().max(1) as u64
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoordResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(Self::ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CoordResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> CoordResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn del(&self, key: &str) -> CoordResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoordResult<bool> {
        let mut conn = self.conn.clone();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(Self::ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn sadd(&self, key: &str, member: &str) -> CoordResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SADD").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> CoordResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> CoordResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> CoordResult<i64> {
        let mut conn = self.conn.clone();
        // SET NX 仅在窗口开启时设置过期 / SET NX arms the expiry only when the window opens
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("PX")
            .arg(Self::ms(window))
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn ping(&self) -> CoordResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
