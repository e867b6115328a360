use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use v::{HealthCheck, HealthStatus};

use super::{
    ConversationStore, MessageStore, ReadStateStore, StoreError, StoreResult, UserStore,
};
use crate::domain::{
    page_messages, sort_messages, Conversation, CursorUpdate, Message, MessagePosition,
    MessageQuery, ReadState, User,
};

/// 内存存储：与 SQL 模式相同的唯一约束 / In-memory backend enforcing the SQL unique keys
#[derive(Default)]
pub struct MemoryStore {
    conversations: DashMap<String, Conversation>,
    dm_index: DashMap<String, String>,
    messages: DashMap<String, Message>,
    // (conversation, sender, clientMessageId) -> message id
    client_ids: DashMap<(String, String, String), String>,
    read_states: DashMap<(String, String), ReadState>,
    users: DashMap<String, User>,
    phones: DashMap<String, String>,
    seq: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rs_key(conversation_id: &str, user_id: &str) -> (String, String) {
        (conversation_id.to_string(), user_id.to_string())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn insert_conversation(&self, conv: &Conversation) -> StoreResult<()> {
        if let Some(key) = &conv.dm_key {
            match self.dm_index.entry(key.clone()) {
                Entry::Occupied(_) => return Err(StoreError::Conflict(format!("dm_key {}", key))),
                Entry::Vacant(slot) => {
                    self.conversations.insert(conv.id.clone(), conv.clone());
                    slot.insert(conv.id.clone());
                    return Ok(());
                }
            }
        }
        match self.conversations.entry(conv.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!("conversation {}", conv.id))),
            Entry::Vacant(slot) => {
                slot.insert(conv.clone());
                Ok(())
            }
        }
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        Ok(self.conversations.get(id).map(|c| c.clone()))
    }

    async fn find_by_dm_key(&self, dm_key: &str) -> StoreResult<Option<Conversation>> {
        let id = match self.dm_index.get(dm_key) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        Ok(self.conversations.get(&id).map(|c| c.clone()))
    }

    async fn update_conversation(
        &self,
        conv: &Conversation,
        expected_version: i64,
    ) -> StoreResult<Conversation> {
        let mut stored = self
            .conversations
            .get_mut(&conv.id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conv.id)))?;
        if stored.version != expected_version {
            return Err(StoreError::StaleVersion);
        }
        stored.participant_ids = conv.participant_ids.clone();
        stored.admin_ids = conv.admin_ids.clone();
        stored.title = conv.title.clone();
        stored.version = expected_version + 1;
        Ok(stored.clone())
    }

    async fn touch_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
        preview: &str,
    ) -> StoreResult<()> {
        let mut stored = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))?;
        if stored.last_message_at.map_or(true, |cur| at >= cur) {
            stored.last_message_id = Some(message_id.to_string());
            stored.last_message_at = Some(at);
            stored.last_message_preview = Some(preview.to_string());
            stored.version += 1;
        }
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Conversation>> {
        let mut list: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.is_participant(user_id))
            .filter(|c| before.map_or(true, |b| c.activity_at() < b))
            .map(|c| c.clone())
            .collect();
        list.sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));
        list.truncate(limit);
        Ok(list)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, mut msg: Message) -> StoreResult<Message> {
        msg.seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(cid) = msg.client_message_id.clone() {
            let key = (msg.conversation_id.clone(), msg.sender_id.clone(), cid);
            match self.client_ids.entry(key) {
                Entry::Occupied(_) => {
                    return Err(StoreError::Conflict("client_message_id".to_string()))
                }
                Entry::Vacant(slot) => {
                    self.messages.insert(msg.id.clone(), msg.clone());
                    slot.insert(msg.id.clone());
                    return Ok(msg);
                }
            }
        }
        self.messages.insert(msg.id.clone(), msg.clone());
        Ok(msg)
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        Ok(self.messages.get(id).map(|m| m.clone()))
    }

    async fn find_by_client_id(
        &self,
        conversation_id: &str,
        sender_id: &str,
        client_message_id: &str,
    ) -> StoreResult<Option<Message>> {
        let key = (
            conversation_id.to_string(),
            sender_id.to_string(),
            client_message_id.to_string(),
        );
        let id = match self.client_ids.get(&key) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn update_message_text(
        &self,
        id: &str,
        text: &str,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<Message> {
        let mut stored = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        stored.text = text.to_string();
        stored.edited_at = Some(edited_at);
        Ok(stored.clone())
    }

    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> StoreResult<Message> {
        let mut stored = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        if stored.deleted_at.is_none() {
            stored.deleted_at = Some(at);
        }
        Ok(stored.clone())
    }

    async fn hide_for_user(&self, id: &str, user_id: &str) -> StoreResult<Message> {
        let mut stored = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        stored.deleted_for_user_ids.insert(user_id.to_string());
        Ok(stored.clone())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        query: &MessageQuery,
    ) -> StoreResult<Vec<Message>> {
        let mut list: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.is_visible_to(viewer_id))
            .map(|m| m.clone())
            .collect();
        sort_messages(&mut list);
        Ok(page_messages(list, query))
    }
}

#[async_trait]
impl ReadStateStore for MemoryStore {
    async fn ensure(&self, conversation_id: &str, user_id: &str) -> StoreResult<ReadState> {
        Ok(self
            .read_states
            .entry(Self::rs_key(conversation_id, user_id))
            .or_insert_with(|| ReadState::new(conversation_id, user_id))
            .clone())
    }

    async fn get(&self, conversation_id: &str, user_id: &str) -> StoreResult<Option<ReadState>> {
        Ok(self
            .read_states
            .get(&Self::rs_key(conversation_id, user_id))
            .map(|r| r.clone()))
    }

    async fn increment_unread(
        &self,
        conversation_id: &str,
        sender_id: &str,
        participant_ids: &[String],
    ) -> StoreResult<()> {
        for uid in participant_ids.iter().filter(|p| p.as_str() != sender_id) {
            self.read_states
                .entry(Self::rs_key(conversation_id, uid))
                .or_insert_with(|| ReadState::new(conversation_id, uid))
                .unread_count += 1;
        }
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
        pos: MessagePosition,
    ) -> StoreResult<CursorUpdate> {
        let mut state = self
            .read_states
            .entry(Self::rs_key(conversation_id, user_id))
            .or_insert_with(|| ReadState::new(conversation_id, user_id));
        let advanced = state.advance_read(message_id, pos);
        Ok(CursorUpdate {
            state: state.clone(),
            advanced,
        })
    }

    async fn mark_delivered(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
        pos: MessagePosition,
    ) -> StoreResult<CursorUpdate> {
        let mut state = self
            .read_states
            .entry(Self::rs_key(conversation_id, user_id))
            .or_insert_with(|| ReadState::new(conversation_id, user_id));
        let advanced = state.advance_delivered(message_id, pos);
        Ok(CursorUpdate {
            state: state.clone(),
            advanced,
        })
    }

    async fn unread_counts(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        Ok(conversation_ids
            .iter()
            .filter_map(|cid| {
                self.read_states
                    .get(&Self::rs_key(cid, user_id))
                    .map(|r| (cid.clone(), r.unread_count))
            })
            .collect())
    }

    async fn set_muted(
        &self,
        conversation_id: &str,
        user_id: &str,
        muted: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<ReadState> {
        let mut state = self
            .read_states
            .entry(Self::rs_key(conversation_id, user_id))
            .or_insert_with(|| ReadState::new(conversation_id, user_id));
        state.is_muted = muted;
        state.muted_until = if muted { until } else { None };
        Ok(state.clone())
    }

    async fn total_unread(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<i64> {
        Ok(self
            .read_states
            .iter()
            .filter(|r| r.user_id == user_id && !r.is_muted_at(now))
            .map(|r| r.unread_count)
            .sum())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        match self.phones.entry(user.phone_number.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "phone_number {}",
                user.phone_number
            ))),
            Entry::Vacant(slot) => {
                self.users.insert(user.id.clone(), user.clone());
                slot.insert(user.id.clone());
                Ok(())
            }
        }
    }

    async fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }

    async fn find_by_phone(&self, phone_number: &str) -> StoreResult<Option<User>> {
        let id = match self.phones.get(phone_number) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn get_users(&self, ids: &[String]) -> StoreResult<Vec<User>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.users.get(id).map(|u| u.clone()))
            .collect())
    }

    async fn update_profile(
        &self,
        id: &str,
        username: Option<&str>,
        avatar_media_id: Option<&str>,
    ) -> StoreResult<User> {
        let mut stored = self
            .users
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", id)))?;
        if let Some(name) = username {
            stored.username = name.to_string();
        }
        if let Some(avatar) = avatar_media_id {
            stored.avatar_media_id = Some(avatar.to_string());
        }
        Ok(stored.clone())
    }

    async fn add_friendship(&self, user_id: &str, friend_id: &str) -> StoreResult<()> {
        if !self.users.contains_key(user_id) || !self.users.contains_key(friend_id) {
            return Err(StoreError::NotFound("user".to_string()));
        }
        if let Some(mut u) = self.users.get_mut(user_id) {
            u.friend_ids.insert(friend_id.to_string());
        }
        if let Some(mut f) = self.users.get_mut(friend_id) {
            f.friend_ids.insert(user_id.to_string());
        }
        Ok(())
    }

    async fn remove_friendship(&self, user_id: &str, friend_id: &str) -> StoreResult<()> {
        if let Some(mut u) = self.users.get_mut(user_id) {
            u.friend_ids.remove(friend_id);
        }
        if let Some(mut f) = self.users.get_mut(friend_id) {
            f.friend_ids.remove(user_id);
        }
        Ok(())
    }

    async fn search_users(&self, query: &str, limit: usize) -> StoreResult<Vec<User>> {
        let needle = query.to_lowercase();
        let mut found: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.is_active())
            .filter(|u| {
                u.username.to_lowercase().contains(&needle) || u.phone_number.contains(&needle)
            })
            .map(|u| u.clone())
            .collect();
        found.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
        found.truncate(limit);
        Ok(found)
    }
}

#[async_trait]
impl HealthCheck for MemoryStore {
    async fn check_health(&self) -> HealthStatus {
        HealthStatus::up("memory_store")
    }
}
