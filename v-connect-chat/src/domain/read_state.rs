use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessagePosition;

/// 已读/送达游标 / Per-(conversation, user) read and delivery cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadState {
    pub conversation_id: String,
    pub user_id: String,
    pub last_read_message_id: Option<String>,
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_read_seq: i64,
    pub last_delivered_message_id: Option<String>,
    pub last_delivered_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_delivered_seq: i64,
    pub unread_count: i64,
    pub is_muted: bool,
    pub muted_until: Option<DateTime<Utc>>,
}

impl ReadState {
    pub fn new(conversation_id: &str, user_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            last_read_message_id: None,
            last_read_at: None,
            last_read_seq: 0,
            last_delivered_message_id: None,
            last_delivered_at: None,
            last_delivered_seq: 0,
            unread_count: 0,
            is_muted: false,
            muted_until: None,
        }
    }

    pub fn read_position(&self) -> Option<MessagePosition> {
        self.last_read_at
            .map(|at| MessagePosition::new(at, self.last_read_seq))
    }

    pub fn delivered_position(&self) -> Option<MessagePosition> {
        self.last_delivered_at
            .map(|at| MessagePosition::new(at, self.last_delivered_seq))
    }

    /// 推进已读游标（仅当目标位置更新）；返回是否推进
    /// Advance the read cursor when `pos` is strictly later; resets unread
    pub fn advance_read(&mut self, message_id: &str, pos: MessagePosition) -> bool {
        if self.read_position().map_or(true, |cur| pos > cur) {
            self.last_read_message_id = Some(message_id.to_string());
            self.last_read_at = Some(pos.at);
            self.last_read_seq = pos.seq;
            self.unread_count = 0;
            true
        } else {
            false
        }
    }

    /// 推进送达游标，与已读无关 / Advance the delivery cursor, independent of read state
    pub fn advance_delivered(&mut self, message_id: &str, pos: MessagePosition) -> bool {
        if self.delivered_position().map_or(true, |cur| pos > cur) {
            self.last_delivered_message_id = Some(message_id.to_string());
            self.last_delivered_at = Some(pos.at);
            self.last_delivered_seq = pos.seq;
            true
        } else {
            false
        }
    }

    /// 免打扰是否生效；`muted_until` 过期即失效
    /// Whether mute is in effect at `now`; an elapsed `muted_until` ends it
    pub fn is_muted_at(&self, now: DateTime<Utc>) -> bool {
        self.is_muted && self.muted_until.map_or(true, |until| until > now)
    }
}

/// 游标更新结果 / Cursor update result
#[derive(Debug, Clone)]
pub struct CursorUpdate {
    pub state: ReadState,
    pub advanced: bool,
}
