use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::coord::{keys, CoordinationStore};
use crate::error::ChatResult;
use crate::service::conversation::ConversationService;

/// 输入状态：短 TTL，尽力而为 / Typing indicators with a short TTL, best effort
pub struct TypingService {
    coord: Arc<dyn CoordinationStore>,
    conversations: Arc<ConversationService>,
    ttl: Duration,
}

impl TypingService {
    pub fn new(
        coord: Arc<dyn CoordinationStore>,
        conversations: Arc<ConversationService>,
        ttl: Duration,
    ) -> Self {
        Self {
            coord,
            conversations,
            ttl,
        }
    }

    /// 写入输入记录，返回需要通知的其他参与者
    /// Write the typing record and return the other participants to notify
    pub async fn set_typing(&self, conversation_id: &str, user_id: &str) -> ChatResult<Vec<String>> {
        let conv = self
            .conversations
            .require_participant(conversation_id, user_id)
            .await?;
        let since = chrono::Utc::now().timestamp_millis().to_string();
        if let Err(e) = self
            .coord
            .set_ex(&keys::typing(conversation_id, user_id), &since, self.ttl)
            .await
        {
            warn!("typing indicator dropped for {}: {}", conversation_id, e);
            return Ok(Vec::new());
        }
        Ok(conv.other_participants(user_id))
    }

    pub async fn clear_typing(&self, conversation_id: &str, user_id: &str) -> ChatResult<Vec<String>> {
        let conv = self
            .conversations
            .require_participant(conversation_id, user_id)
            .await?;
        if let Err(e) = self.coord.del(&keys::typing(conversation_id, user_id)).await {
            warn!("typing clear dropped for {}: {}", conversation_id, e);
            return Ok(Vec::new());
        }
        Ok(conv.other_participants(user_id))
    }

    pub async fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        matches!(
            self.coord.get(&keys::typing(conversation_id, user_id)).await,
            Ok(Some(_))
        )
    }

    /// 当前正在输入的参与者 / Participants currently typing
    pub async fn get_typing_users(&self, conversation_id: &str) -> ChatResult<Vec<String>> {
        let conv = self.conversations.get_conversation(conversation_id).await?;
        let participants: Vec<String> = conv.participant_ids.into_iter().collect();
        let keys: Vec<String> = participants
            .iter()
            .map(|p| keys::typing(conversation_id, p))
            .collect();
        match self.coord.mget(&keys).await {
            Ok(values) => Ok(participants
                .into_iter()
                .zip(values)
                .filter_map(|(p, v)| v.map(|_| p))
                .collect()),
            Err(e) => {
                warn!("typing read degraded for {}: {}", conversation_id, e);
                Ok(Vec::new())
            }
        }
    }
}
