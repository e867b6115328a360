use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::MessageType;

/// 实时事件信封 / Real-time event envelope: `{"type": <event>, "data": <payload>}`
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ChatEvent {
    pub fn new(event: &str, data: impl Serialize) -> Self {
        Self {
            event: event.to_string(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// 解析负载，缺失时按空对象处理 / Parse payload; a missing payload reads as `{}`
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            serde_json::Value::Null => serde_json::from_value(serde_json::json!({})),
            other => serde_json::from_value(other.clone()),
        }
    }
}

/// 错误事件负载 / Error event payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BinaryFile {
    /// 原始字节 / raw bytes
    pub buffer: Vec<u8>,
    pub mimetype: Option<String>,
    pub originalname: Option<String>,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub passcode: String,
    pub avatar: Option<BinaryFile>,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignInPayload {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub passcode: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
pub struct AuthenticatePayload {
    pub token: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfilePayload {
    pub username: Option<String>,
    pub avatar_media_id: Option<String>,
}

/// `chatMessage`：按接收方手机号（单聊）或会话ID（群聊）发送
/// Send by receiver phone (DM) or by conversation id (group)
#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub receiver: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message: String,
    pub message_type: Option<MessageType>,
    pub media_file: Option<BinaryFile>,
    pub client_message_id: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetChatMessagesPayload {
    pub user_phone_number: Option<String>,
    pub friend_phone_number: Option<String>,
    pub conversation_id: Option<String>,
    pub limit: Option<usize>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    /// 以消息为锚点，优先于时间戳 / Message anchors, preferred over timestamps
    pub before_message_id: Option<String>,
    pub after_message_id: Option<String>,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetConversationsPayload {
    pub limit: Option<usize>,
    pub before: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EditMessagePayload {
    pub message_id: String,
    pub new_text: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageIdPayload {
    pub message_id: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CursorPayload {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub conversation_id: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MutePayload {
    pub conversation_id: String,
    /// 缺省为永久 / indefinite when absent
    pub duration_ms: Option<u64>,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchUsersPayload {
    #[serde(default, alias = "searchTerm", alias = "friendPhoneNumber")]
    pub query: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub participant_ids: Vec<String>,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPayload {
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddFriendPayload {
    pub friend_phone: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFriendPayload {
    pub friend_id: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetPresencePayload {
    #[serde(default)]
    pub user_ids: Vec<String>,
}

#[derive(Deserialize, Debug, JsonSchema)]
pub struct CallPayload {
    /// 被叫手机号 / receiver phone
    pub receiver: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallReplyPayload {
    /// 主叫手机号 / caller phone
    pub caller: String,
    pub call_id: String,
}

#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HangUpPayload {
    pub call_id: String,
    pub caller: String,
    pub receiver: String,
}

/// WebRTC 信令透传（offer / iceCandidate / answer-webrtc）/ Signaling relay payload
#[derive(Deserialize, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub target_socket_id: String,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}
