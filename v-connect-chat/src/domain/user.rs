use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 用户 / Registered user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub phone_number: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub passcode_hash: String,
    pub avatar_media_id: Option<String>,
    pub friend_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(phone_number: &str, username: &str, passcode_hash: String) -> Self {
        Self {
            id: super::new_id(),
            phone_number: phone_number.to_string(),
            username: username.to_string(),
            passcode_hash,
            avatar_media_id: None,
            friend_ids: BTreeSet::new(),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            phone_number: self.phone_number.clone(),
            username: self.username.clone(),
            avatar_media_id: self.avatar_media_id.clone(),
        }
    }
}

/// 对外用户摘要 / Public user summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub phone_number: String,
    pub username: String,
    pub avatar_media_id: Option<String>,
}

/// 好友摘要（附在线状态）/ Friend summary with online flag
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendSummary {
    #[serde(flatten)]
    pub user: UserSummary,
    pub is_online: bool,
}
