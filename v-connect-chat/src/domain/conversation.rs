use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessageType;

/// 群组标题最大长度 / Maximum group title length
pub const MAX_TITLE_LEN: usize = 100;
/// 最后一条消息预览长度 / Last-message preview length
pub const PREVIEW_LEN: usize = 100;

/// 会话类型 / Conversation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Dm,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Dm => "dm",
            ConversationKind::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dm" => Some(ConversationKind::Dm),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

/// 会话 / Conversation (DM or group thread)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub participant_ids: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dm_key: Option<String>,
    pub admin_ids: BTreeSet<String>,
    pub title: Option<String>,
    pub last_message_id: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// 单聊唯一键：参与者排序后以 `:` 连接
/// Deterministic DM key: sorted participant ids joined by `:`
pub fn dm_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

impl Conversation {
    pub fn new_dm(a: &str, b: &str) -> Self {
        Self {
            id: super::new_id(),
            kind: ConversationKind::Dm,
            participant_ids: [a.to_string(), b.to_string()].into_iter().collect(),
            dm_key: Some(dm_key(a, b)),
            admin_ids: BTreeSet::new(),
            title: None,
            last_message_id: None,
            last_message_at: None,
            last_message_preview: None,
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn new_group(creator_id: &str, participant_ids: BTreeSet<String>, title: String) -> Self {
        Self {
            id: super::new_id(),
            kind: ConversationKind::Group,
            participant_ids,
            dm_key: None,
            admin_ids: std::iter::once(creator_id.to_string()).collect(),
            title: Some(title),
            last_message_id: None,
            last_message_at: None,
            last_message_preview: None,
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_dm(&self) -> bool {
        self.kind == ConversationKind::Dm
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_ids.contains(user_id)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_ids.contains(user_id)
    }

    /// 除指定用户外的参与者 / Participants other than `user_id`
    pub fn other_participants(&self, user_id: &str) -> Vec<String> {
        self.participant_ids
            .iter()
            .filter(|p| p.as_str() != user_id)
            .cloned()
            .collect()
    }

    /// 排序用的活跃时间 / Activity time used for ordering conversation lists
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

/// 会话列表项（附带调用者未读数）/ Conversation annotated with the caller's unread count
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: i64,
}

/// 最后一条消息预览：文本前100字符，否则为 `[type]`
/// Preview: first 100 characters of text, otherwise `[type]`
pub fn message_preview(text: &str, message_type: MessageType) -> String {
    if text.is_empty() {
        format!("[{}]", message_type.as_str())
    } else {
        text.chars().take(PREVIEW_LEN).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dm_key_is_order_independent() {
        assert_eq!(dm_key("alice", "bob"), "alice:bob");
        assert_eq!(dm_key("bob", "alice"), "alice:bob");
    }

    #[test]
    fn test_group_creator_is_admin() {
        let participants: BTreeSet<String> =
            ["u1", "u2", "u3"].iter().map(|s| s.to_string()).collect();
        let conv = Conversation::new_group("u1", participants, "team".into());
        assert!(conv.is_admin("u1"));
        assert!(!conv.is_admin("u2"));
        assert_eq!(conv.other_participants("u1"), vec!["u2", "u3"]);
    }

    #[test]
    fn test_preview_truncates_by_characters() {
        let long = "é".repeat(150);
        assert_eq!(message_preview(&long, MessageType::Text).chars().count(), 100);
        assert_eq!(message_preview("", MessageType::Image), "[image]");
    }
}
