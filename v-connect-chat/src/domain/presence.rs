use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// 协调存储中的在线记录（`presence:{uid}`）/ Stored presence record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    /// 毫秒时间戳 / epoch millis
    pub last_seen: i64,
    pub socket_id: Option<String>,
}

/// 在线状态视图 / Presence view returned to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub connection_ids: Vec<String>,
}

impl Presence {
    /// 无记录即离线 / Absent record reads as offline
    pub fn absent(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            last_seen_at: None,
            connection_ids: Vec::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

/// 最后一个连接断开时的离线信号 / Emitted when the last live connection is removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineTransition {
    pub user_id: String,
    pub last_seen_at: DateTime<Utc>,
}
