use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息文本最大长度 / Maximum message text length
pub const MAX_TEXT_LEN: usize = 10_000;
/// 默认分页大小 / Default page size
pub const DEFAULT_PAGE_LIMIT: usize = 50;
/// 分页上限 / Page size cap
pub const MAX_PAGE_LIMIT: usize = 200;

/// 消息类型 / Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::File => "file",
            MessageType::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            "video" => Some(MessageType::Video),
            "audio" => Some(MessageType::Audio),
            "file" => Some(MessageType::File),
            "system" => Some(MessageType::System),
            _ => None,
        }
    }
}

/// 消息 / Message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub text: String,
    pub media_ref: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub client_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deleted_for_user_ids: BTreeSet<String>,
    /// 插入序号，用于同一时间戳的排序 / Insertion sequence, breaks createdAt ties
    #[serde(skip)]
    pub seq: i64,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// 对某个查看者是否可见 / Whether visible to `viewer_id`
    pub fn is_visible_to(&self, viewer_id: &str) -> bool {
        !self.is_deleted() && !self.deleted_for_user_ids.contains(viewer_id)
    }
}

/// 发送消息请求 / Send request
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub message_type: MessageType,
    pub text: String,
    pub media_ref: Option<String>,
    pub reply_to: Option<String>,
    pub client_message_id: Option<String>,
}

impl NewMessage {
    pub fn text(conversation_id: &str, sender_id: &str, text: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            message_type: MessageType::Text,
            text: text.to_string(),
            media_ref: None,
            reply_to: None,
            client_message_id: None,
        }
    }

    pub fn with_client_id(mut self, client_message_id: &str) -> Self {
        self.client_message_id = Some(client_message_id.to_string());
        self
    }

    pub(crate) fn into_message(self) -> Message {
        Message {
            id: super::new_id(),
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            message_type: self.message_type,
            text: self.text,
            media_ref: self.media_ref,
            reply_to_message_id: self.reply_to,
            client_message_id: self.client_message_id,
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
            deleted_for_user_ids: BTreeSet::new(),
            seq: 0,
        }
    }
}

/// 发送结果（幂等重发时 is_duplicate=true）/ Send outcome
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    pub is_duplicate: bool,
}

/// 消息在会话中的全序位置 (createdAt, seq)
/// Total-order position of a message; `seq` breaks createdAt ties
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessagePosition {
    pub at: DateTime<Utc>,
    pub seq: i64,
}

impl MessagePosition {
    pub fn new(at: DateTime<Utc>, seq: i64) -> Self {
        Self { at, seq }
    }

    pub fn of(message: &Message) -> Self {
        Self::new(message.created_at, message.seq)
    }

    /// 排在 `at` 时刻所有消息之前 / Sorts before every message stamped `at`
    pub fn start_of(at: DateTime<Utc>) -> Self {
        Self::new(at, i64::MIN)
    }

    /// 排在 `at` 时刻所有消息之后 / Sorts after every message stamped `at`
    pub fn end_of(at: DateTime<Utc>) -> Self {
        Self::new(at, i64::MAX)
    }
}

/// 消息分页查询 / Message page query
///
/// - 指定 `after`：返回其后最早的 `limit` 条
/// - 否则：返回 `before`（缺省为现在）之前最新的 `limit` 条
/// 结果始终按 (createdAt, seq) 升序，边界严格排除
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub limit: Option<usize>,
    pub before: Option<MessagePosition>,
    pub after: Option<MessagePosition>,
}

impl MessageQuery {
    /// 纯时间戳边界：`before` 排除该时刻全部消息，`after` 同理
    /// Timestamp-only bounds exclude every message stamped exactly at the bound
    pub fn by_time(
        limit: Option<usize>,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            limit,
            before: before.map(MessagePosition::start_of),
            after: after.map(MessagePosition::end_of),
        }
    }

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }
}

/// 按 (createdAt, seq) 排序 / Canonical ordering
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.seq.cmp(&b.seq))
    });
}

/// 对已按序排列的可见消息应用分页 / Apply a page window to ordered messages
pub fn page_messages(mut ordered: Vec<Message>, query: &MessageQuery) -> Vec<Message> {
    let limit = query.effective_limit();
    ordered.retain(|m| {
        let pos = MessagePosition::of(m);
        query.before.map_or(true, |b| pos < b) && query.after.map_or(true, |a| pos > a)
    });
    if query.after.is_some() {
        ordered.truncate(limit);
        ordered
    } else {
        let skip = ordered.len().saturating_sub(limit);
        ordered.split_off(skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn msg(seq: i64, offset_secs: i64) -> Message {
        let mut m = NewMessage::text("c1", "u1", &format!("m{}", seq)).into_message();
        m.seq = seq;
        m.created_at = DateTime::<Utc>::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap();
        m
    }

    #[test]
    fn test_ties_broken_by_insertion_sequence() {
        let mut list = vec![msg(2, 10), msg(1, 10), msg(0, 5)];
        sort_messages(&mut list);
        let seqs: Vec<i64> = list.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_default_page_returns_latest_ascending() {
        let list: Vec<Message> = (0..10).map(|i| msg(i, i)).collect();
        let page = page_messages(
            list,
            &MessageQuery {
                limit: Some(3),
                ..Default::default()
            },
        );
        let seqs: Vec<i64> = page.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![7, 8, 9]);
    }

    #[test]
    fn test_before_and_after_cursors() {
        let list: Vec<Message> = (0..10).map(|i| msg(i, i)).collect();
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let before = page_messages(
            list.clone(),
            &MessageQuery::by_time(Some(2), Some(base + Duration::seconds(5)), None),
        );
        assert_eq!(before.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3, 4]);

        let after = page_messages(
            list,
            &MessageQuery::by_time(Some(2), None, Some(base + Duration::seconds(5))),
        );
        assert_eq!(after.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![6, 7]);
    }

    #[test]
    fn test_page_boundary_inside_timestamp_tie() {
        // 五条消息共用同一时间戳，页边界落在中间
        let mut list: Vec<Message> = (1..=5).map(|i| msg(i, 10)).collect();
        list.insert(0, msg(0, 5));
        sort_messages(&mut list);

        let first = page_messages(
            list.clone(),
            &MessageQuery {
                limit: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(first.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![4, 5]);

        let older = page_messages(
            list.clone(),
            &MessageQuery {
                limit: Some(2),
                before: Some(MessagePosition::of(&first[0])),
                after: None,
            },
        );
        assert_eq!(older.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3]);

        let newer = page_messages(
            list.clone(),
            &MessageQuery {
                limit: Some(10),
                before: None,
                after: Some(MessagePosition::of(&older[0])),
            },
        );
        assert_eq!(newer.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3, 4, 5]);

        // 纯时间戳边界排除整组并列消息
        let tied_at = list[1].created_at;
        let by_time = page_messages(list, &MessageQuery::by_time(Some(10), Some(tied_at), None));
        assert_eq!(by_time.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_visibility_rules() {
        let mut m = msg(0, 0);
        assert!(m.is_visible_to("u2"));
        m.deleted_for_user_ids.insert("u2".into());
        assert!(!m.is_visible_to("u2"));
        assert!(m.is_visible_to("u3"));
        m.deleted_at = Some(Utc::now());
        assert!(!m.is_visible_to("u3"));
    }
}
