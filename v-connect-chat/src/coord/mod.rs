//! 共享协调存储 / Shared coordination store
//!
//! 所有进程共享的带 TTL 键值空间：在线状态、输入状态、限流计数
//! TTL key space shared by every process: presence, typing and rate-limit counters

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use v::HealthStatus;

pub use memory::MemoryCoordStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCoordStore;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("coordination protocol error: {0}")]
    Protocol(String),
}

pub type CoordResult<T> = std::result::Result<T, CoordError>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoordResult<()>;
    async fn get(&self, key: &str) -> CoordResult<Option<String>>;
    async fn mget(&self, keys: &[String]) -> CoordResult<Vec<Option<String>>>;
    async fn del(&self, key: &str) -> CoordResult<()>;
    /// 刷新过期时间；键不存在返回 false / Refresh TTL; false when the key is absent
    async fn expire(&self, key: &str, ttl: Duration) -> CoordResult<bool>;
    async fn sadd(&self, key: &str, member: &str) -> CoordResult<()>;
    async fn srem(&self, key: &str, member: &str) -> CoordResult<()>;
    async fn smembers(&self, key: &str) -> CoordResult<Vec<String>>;
    /// 原子自增；计数变为 1 时才设置窗口过期
    /// Atomic increment; the window expiry is set only when the counter becomes 1
    async fn incr_window(&self, key: &str, window: Duration) -> CoordResult<i64>;
    async fn ping(&self) -> CoordResult<()>;
}

/// 协调存储健康检查 / Health sample for a coordination store
pub async fn check_health(store: &dyn CoordinationStore) -> HealthStatus {
    match store.ping().await {
        Ok(()) => HealthStatus::up("coordination_store"),
        Err(e) => HealthStatus::down("coordination_store", e.to_string()),
    }
}

/// 键空间 / Key space
pub mod keys {
    pub fn presence(user_id: &str) -> String {
        format!("presence:{}", user_id)
    }

    pub fn user_sockets(user_id: &str) -> String {
        format!("user_sockets:{}", user_id)
    }

    pub fn socket_user(connection_id: &str) -> String {
        format!("socket_user:{}", connection_id)
    }

    pub fn typing(conversation_id: &str, user_id: &str) -> String {
        format!("typing:{}:{}", conversation_id, user_id)
    }

    pub fn rate_limit(identity: &str, event_type: &str) -> String {
        format!("rl:{}:{}", identity, event_type)
    }

    pub fn sign_in_failures(phone_number: &str) -> String {
        format!("signin_fail:{}", phone_number)
    }
}
