use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::debug;

use crate::domain::{
    message_preview, Conversation, CursorUpdate, Message, MessagePosition, MessageQuery,
    NewMessage, ReadState, SendOutcome, MAX_TEXT_LEN,
};
use crate::error::{ChatError, ChatResult};
use crate::service::conversation::ConversationService;
use crate::service::events::{publish_detached, EventPublisher, OutboundEvent};
use crate::storage::{StoreError, Stores};

pub struct MessageService {
    stores: Stores,
    conversations: Arc<ConversationService>,
    publisher: Arc<dyn EventPublisher>,
}

fn validate_text(text: &str) -> ChatResult<()> {
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(ChatError::validation(format!(
            "Message text must be at most {} characters",
            MAX_TEXT_LEN
        )));
    }
    Ok(())
}

impl MessageService {
    pub fn new(
        stores: Stores,
        conversations: Arc<ConversationService>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            stores,
            conversations,
            publisher,
        }
    }

    /// 发送消息；相同幂等键的重发返回既有消息并标记 `is_duplicate`
    /// Send a message; a resend with the same idempotency key returns the stored one
    pub async fn send_message(&self, draft: NewMessage) -> ChatResult<SendOutcome> {
        validate_text(&draft.text)?;
        if draft.text.trim().is_empty() && draft.media_ref.is_none() {
            return Err(ChatError::validation("Message text or media is required"));
        }
        let conv = self
            .conversations
            .require_participant(&draft.conversation_id, &draft.sender_id)
            .await?;

        if let Some(reply_to) = &draft.reply_to {
            let target = self.stores.messages.get_message(reply_to).await?;
            if target.map_or(true, |m| m.conversation_id != conv.id) {
                return Err(ChatError::InvalidArgument(
                    "Reply target must belong to the same conversation".to_string(),
                ));
            }
        }

        if let Some(cid) = &draft.client_message_id {
            if let Some(existing) = self
                .stores
                .messages
                .find_by_client_id(&conv.id, &draft.sender_id, cid)
                .await?
            {
                debug!("duplicate send {} absorbed", cid);
                return Ok(SendOutcome {
                    message: existing,
                    is_duplicate: true,
                });
            }
        }

        let client_id = draft.client_message_id.clone();
        let sender_id = draft.sender_id.clone();
        let message = match self.stores.messages.insert_message(draft.into_message()).await {
            Ok(m) => m,
            Err(StoreError::Conflict(reason)) => {
                let Some(cid) = client_id else {
                    return Err(ChatError::Conflict(reason));
                };
                let existing = self
                    .stores
                    .messages
                    .find_by_client_id(&conv.id, &sender_id, &cid)
                    .await?
                    .ok_or(ChatError::Conflict(reason))?;
                return Ok(SendOutcome {
                    message: existing,
                    is_duplicate: true,
                });
            }
            Err(e) => return Err(e.into()),
        };

        self.apply_side_effects(&conv, &message).await?;
        publish_detached(
            self.publisher.clone(),
            OutboundEvent::new(
                "message.created",
                json!({
                    "messageId": message.id,
                    "conversationId": message.conversation_id,
                    "senderId": message.sender_id,
                    "type": message.message_type,
                    "recipientIds": conv.other_participants(&message.sender_id),
                    "createdAt": message.created_at,
                }),
            ),
        );
        Ok(SendOutcome {
            message,
            is_duplicate: false,
        })
    }

    async fn apply_side_effects(&self, conv: &Conversation, message: &Message) -> ChatResult<()> {
        let preview = message_preview(&message.text, message.message_type);
        self.stores
            .conversations
            .touch_last_message(&conv.id, &message.id, message.created_at, &preview)
            .await?;
        let participants: Vec<String> = conv.participant_ids.iter().cloned().collect();
        self.stores
            .read_states
            .increment_unread(&conv.id, &message.sender_id, &participants)
            .await?;
        Ok(())
    }

    /// 按接收方手机号发送单聊 / Send a DM addressed by the receiver's phone number
    pub async fn send_direct(
        &self,
        receiver_phone: &str,
        mut draft: NewMessage,
    ) -> ChatResult<(SendOutcome, Conversation)> {
        let receiver_phone = receiver_phone.trim();
        if receiver_phone.is_empty() {
            return Err(ChatError::validation("Receiver is required"));
        }
        let receiver = self
            .stores
            .users
            .find_by_phone(receiver_phone)
            .await?
            .filter(|u| u.is_active())
            .ok_or_else(|| ChatError::not_found("Receiver not found"))?;
        let conv = self
            .conversations
            .get_or_create_dm(&draft.sender_id, &receiver.id)
            .await?;
        draft.conversation_id = conv.id.clone();
        let outcome = self.send_message(draft).await?;
        Ok((outcome, conv))
    }

    pub async fn get_message(&self, message_id: &str) -> ChatResult<Message> {
        self.stores
            .messages
            .get_message(message_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Message not found"))
    }

    pub async fn edit_message(
        &self,
        message_id: &str,
        editor_id: &str,
        new_text: &str,
    ) -> ChatResult<Message> {
        if new_text.trim().is_empty() {
            return Err(ChatError::validation("New text is required"));
        }
        validate_text(new_text)?;
        let message = self.get_message(message_id).await?;
        if message.sender_id != editor_id {
            return Err(ChatError::forbidden("Only the sender can edit this message"));
        }
        if message.is_deleted() {
            return Err(ChatError::InvalidOperation(
                "Cannot edit a deleted message".to_string(),
            ));
        }
        let edited = self
            .stores
            .messages
            .update_message_text(message_id, new_text, Utc::now())
            .await?;
        publish_detached(
            self.publisher.clone(),
            OutboundEvent::new(
                "message.edited",
                json!({"messageId": edited.id, "conversationId": edited.conversation_id}),
            ),
        );
        Ok(edited)
    }

    /// 全局墓碑，仅发送者；幂等 / Sender-only tombstone, idempotent
    pub async fn soft_delete(&self, message_id: &str, deleter_id: &str) -> ChatResult<Message> {
        let message = self.get_message(message_id).await?;
        if message.sender_id != deleter_id {
            return Err(ChatError::forbidden("Only the sender can delete this message"));
        }
        let already = message.is_deleted();
        let deleted = self.stores.messages.soft_delete(message_id, Utc::now()).await?;
        if !already {
            publish_detached(
                self.publisher.clone(),
                OutboundEvent::new(
                    "message.deleted",
                    json!({"messageId": deleted.id, "conversationId": deleted.conversation_id}),
                ),
            );
        }
        Ok(deleted)
    }

    /// 仅对自己隐藏 / Hide for one viewer
    pub async fn delete_for_user(&self, message_id: &str, user_id: &str) -> ChatResult<Message> {
        let message = self.get_message(message_id).await?;
        self.conversations
            .require_participant(&message.conversation_id, user_id)
            .await?;
        Ok(self.stores.messages.hide_for_user(message_id, user_id).await?)
    }

    pub async fn get_messages(
        &self,
        conversation_id: &str,
        caller_id: &str,
        query: &MessageQuery,
    ) -> ChatResult<Vec<Message>> {
        self.conversations
            .require_participant(conversation_id, caller_id)
            .await?;
        Ok(self
            .stores
            .messages
            .list_messages(conversation_id, caller_id, query)
            .await?)
    }

    /// 与某好友的单聊历史；尚无会话时为空 / DM history with a peer; empty when no DM exists yet
    pub async fn get_messages_with(
        &self,
        caller_id: &str,
        peer_phone: &str,
        query: &MessageQuery,
    ) -> ChatResult<(Option<Conversation>, Vec<Message>)> {
        let peer = self
            .stores
            .users
            .find_by_phone(peer_phone.trim())
            .await?
            .ok_or_else(|| ChatError::not_found("User not found"))?;
        match self.conversations.find_dm(caller_id, &peer.id).await? {
            Some(conv) => {
                let list = self.get_messages(&conv.id, caller_id, query).await?;
                Ok((Some(conv), list))
            }
            None => Ok((None, Vec::new())),
        }
    }

    /// 已读游标只前进 / Monotonic read cursor
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> ChatResult<CursorUpdate> {
        let message = self.cursor_target(conversation_id, user_id, message_id).await?;
        Ok(self
            .stores
            .read_states
            .mark_read(conversation_id, user_id, &message.id, MessagePosition::of(&message))
            .await?)
    }

    pub async fn mark_delivered(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> ChatResult<CursorUpdate> {
        let message = self.cursor_target(conversation_id, user_id, message_id).await?;
        Ok(self
            .stores
            .read_states
            .mark_delivered(conversation_id, user_id, &message.id, MessagePosition::of(&message))
            .await?)
    }

    pub async fn unread_count(&self, conversation_id: &str, user_id: &str) -> ChatResult<i64> {
        Ok(self
            .stores
            .read_states
            .get(conversation_id, user_id)
            .await?
            .map_or(0, |r| r.unread_count))
    }

    /// 未免打扰会话的未读总数 / Total unread across conversations that are not muted
    pub async fn total_unread(&self, user_id: &str) -> ChatResult<i64> {
        Ok(self.stores.read_states.total_unread(user_id, Utc::now()).await?)
    }

    /// 免打扰；`duration` 缺省为永久 / Mute, indefinitely when `duration` is None
    pub async fn mute(
        &self,
        conversation_id: &str,
        user_id: &str,
        duration: Option<Duration>,
    ) -> ChatResult<ReadState> {
        if duration.map_or(false, |d| d <= Duration::zero()) {
            return Err(ChatError::validation("Mute duration must be positive"));
        }
        self.conversations
            .require_participant(conversation_id, user_id)
            .await?;
        let until: Option<DateTime<Utc>> = duration.map(|d| Utc::now() + d);
        Ok(self
            .stores
            .read_states
            .set_muted(conversation_id, user_id, true, until)
            .await?)
    }

    pub async fn unmute(&self, conversation_id: &str, user_id: &str) -> ChatResult<ReadState> {
        self.conversations
            .require_participant(conversation_id, user_id)
            .await?;
        Ok(self
            .stores
            .read_states
            .set_muted(conversation_id, user_id, false, None)
            .await?)
    }

    /// 以消息为分页锚点；调用者须为该会话成员
    /// Resolve a message id into a page anchor; the caller must be a participant
    pub async fn position_of(&self, message_id: &str, caller_id: &str) -> ChatResult<MessagePosition> {
        let message = self.get_message(message_id).await?;
        self.conversations
            .require_participant(&message.conversation_id, caller_id)
            .await?;
        Ok(MessagePosition::of(&message))
    }

    async fn cursor_target(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> ChatResult<Message> {
        self.conversations
            .require_participant(conversation_id, user_id)
            .await?;
        let message = self.get_message(message_id).await?;
        if message.conversation_id != conversation_id {
            return Err(ChatError::InvalidArgument(
                "Message does not belong to this conversation".to_string(),
            ));
        }
        Ok(message)
    }
}
