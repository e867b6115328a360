use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::config::PresenceConfig;
use crate::coord::{keys, CoordinationStore};
use crate::domain::{OfflineTransition, Presence, PresenceRecord, PresenceStatus};
use crate::error::ChatResult;

/// 在线状态注册表 / Presence registry over the shared coordination store
///
/// 状态机：ABSENT → ONLINE（首个连接）→ ONLINE（按连接集合计数）
/// → OFFLINE（最后一个连接移除，记录 lastSeen）→ ABSENT（TTL 衰减）
pub struct PresenceService {
    coord: Arc<dyn CoordinationStore>,
    cfg: PresenceConfig,
}

fn millis_to_time(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

impl PresenceService {
    pub fn new(coord: Arc<dyn CoordinationStore>, cfg: PresenceConfig) -> Self {
        Self { coord, cfg }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.cfg
    }

    async fn write_record(
        &self,
        user_id: &str,
        record: &PresenceRecord,
        ttl: std::time::Duration,
    ) -> ChatResult<()> {
        let body = serde_json::to_string(record)
            .map_err(|e| crate::error::ChatError::Infrastructure(e.to_string()))?;
        self.coord.set_ex(&keys::presence(user_id), &body, ttl).await?;
        Ok(())
    }

    /// 注册连接并刷新 TTL / Register a live connection and refresh TTLs
    pub async fn set_online(&self, user_id: &str, connection_id: &str) -> ChatResult<()> {
        let ttl = self.cfg.ttl;
        let record = PresenceRecord {
            status: PresenceStatus::Online,
            last_seen: Utc::now().timestamp_millis(),
            socket_id: Some(connection_id.to_string()),
        };
        self.write_record(user_id, &record, ttl).await?;
        let sockets = keys::user_sockets(user_id);
        self.coord.sadd(&sockets, connection_id).await?;
        self.coord.expire(&sockets, ttl).await?;
        self.coord
            .set_ex(&keys::socket_user(connection_id), user_id, ttl)
            .await?;
        debug!("presence online: {} via {}", user_id, connection_id);
        Ok(())
    }

    /// 按反向索引查找用户并移除连接 / Remove a connection found through the reverse index
    pub async fn set_offline(&self, connection_id: &str) -> ChatResult<Option<OfflineTransition>> {
        let owner = self.coord.get(&keys::socket_user(connection_id)).await?;
        match owner {
            Some(user_id) => self.release(&user_id, connection_id).await,
            None => Ok(None),
        }
    }

    /// 反向索引已过期时由网关提供用户 / Variant used when the owning user is already known
    pub async fn set_offline_as(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> ChatResult<Option<OfflineTransition>> {
        let owner = self.coord.get(&keys::socket_user(connection_id)).await?;
        let user_id = owner.unwrap_or_else(|| user_id.to_string());
        self.release(&user_id, connection_id).await
    }

    async fn release(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> ChatResult<Option<OfflineTransition>> {
        self.coord.del(&keys::socket_user(connection_id)).await?;
        let sockets = keys::user_sockets(user_id);
        self.coord.srem(&sockets, connection_id).await?;
        if !self.coord.smembers(&sockets).await?.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();
        let record = PresenceRecord {
            status: PresenceStatus::Offline,
            last_seen: now.timestamp_millis(),
            socket_id: None,
        };
        let ttl = self.cfg.ttl * self.cfg.offline_ttl_multiplier.max(1);
        self.write_record(user_id, &record, ttl).await?;
        info!("user {} went offline", user_id);
        Ok(Some(OfflineTransition {
            user_id: user_id.to_string(),
            last_seen_at: millis_to_time(record.last_seen).unwrap_or(now),
        }))
    }

    /// 刷新全部相关 TTL；记录已衰减时重新注册
    /// Refresh every related TTL; re-register when the record already decayed
    pub async fn heartbeat(&self, user_id: &str, connection_id: &str) -> ChatResult<()> {
        let ttl = self.cfg.ttl;
        let presence_alive = self.coord.expire(&keys::presence(user_id), ttl).await?;
        let owner_alive = self
            .coord
            .expire(&keys::socket_user(connection_id), ttl)
            .await?;
        let sockets_alive = self.coord.expire(&keys::user_sockets(user_id), ttl).await?;
        if !(presence_alive && owner_alive && sockets_alive) {
            return self.set_online(user_id, connection_id).await;
        }
        Ok(())
    }

    /// 读取在线状态；存储不可达视为离线 / Pure read; an unreachable store reads as offline
    pub async fn get_presence(&self, user_id: &str) -> Presence {
        let record = match self.coord.get(&keys::presence(user_id)).await {
            Ok(raw) => raw.and_then(|r| serde_json::from_str::<PresenceRecord>(&r).ok()),
            Err(e) => {
                warn!("presence read degraded for {}: {}", user_id, e);
                return Presence::absent(user_id);
            }
        };
        let connections = self.get_user_connections(user_id).await;
        Self::view(user_id, record, connections)
    }

    pub async fn get_presence_batch(&self, user_ids: &[String]) -> Vec<Presence> {
        let keys: Vec<String> = user_ids.iter().map(|u| keys::presence(u)).collect();
        let records = match self.coord.mget(&keys).await {
            Ok(r) => r,
            Err(e) => {
                warn!("presence batch read degraded: {}", e);
                return user_ids.iter().map(|u| Presence::absent(u)).collect();
            }
        };
        let mut out = Vec::with_capacity(user_ids.len());
        for (user_id, raw) in user_ids.iter().zip(records) {
            let record = raw.and_then(|r| serde_json::from_str::<PresenceRecord>(&r).ok());
            let connections = match &record {
                Some(_) => self.get_user_connections(user_id).await,
                None => Vec::new(),
            };
            out.push(Self::view(user_id, record, connections));
        }
        out
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.get_presence(user_id).await.is_online()
    }

    /// 用户的全部在线连接；读取失败返回空 / Live connection ids; empty on failure
    pub async fn get_user_connections(&self, user_id: &str) -> Vec<String> {
        match self.coord.smembers(&keys::user_sockets(user_id)).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("connection lookup degraded for {}: {}", user_id, e);
                Vec::new()
            }
        }
    }

    fn view(user_id: &str, record: Option<PresenceRecord>, connections: Vec<String>) -> Presence {
        let Some(record) = record else {
            return Presence::absent(user_id);
        };
        let status = if connections.is_empty() {
            PresenceStatus::Offline
        } else {
            PresenceStatus::Online
        };
        Presence {
            user_id: user_id.to_string(),
            status,
            last_seen_at: millis_to_time(record.last_seen),
            connection_ids: connections,
        }
    }
}
