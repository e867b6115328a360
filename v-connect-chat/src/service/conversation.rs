use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::domain::{dm_key, Conversation, ConversationSummary, MAX_TITLE_LEN};
use crate::error::{ChatError, ChatResult};
use crate::storage::{StoreError, Stores};

/// 乐观锁重试次数 / Compare-and-swap attempts before giving up
const CAS_RETRIES: usize = 3;
pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;
/// 群组最少参与者 / A group never drops below this many participants
pub const MIN_GROUP_PARTICIPANTS: usize = 2;

pub struct ConversationService {
    stores: Stores,
}

impl ConversationService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// 获取或创建单聊；并发创建时后写者读取已存在记录
    /// Get or create the DM; a concurrent loser reads the winner's record
    pub async fn get_or_create_dm(&self, user_a: &str, user_b: &str) -> ChatResult<Conversation> {
        if user_a == user_b {
            return Err(ChatError::InvalidArgument(
                "Cannot start a conversation with yourself".to_string(),
            ));
        }
        let key = dm_key(user_a, user_b);
        if let Some(existing) = self.stores.conversations.find_by_dm_key(&key).await? {
            return Ok(existing);
        }
        let conv = Conversation::new_dm(user_a, user_b);
        match self.stores.conversations.insert_conversation(&conv).await {
            Ok(()) => {
                self.ensure_read_states(&conv).await?;
                debug!("created dm {} ({})", conv.id, key);
                Ok(conv)
            }
            Err(StoreError::Conflict(_)) => self
                .stores
                .conversations
                .find_by_dm_key(&key)
                .await?
                .ok_or_else(|| ChatError::Infrastructure(format!("dm {} vanished after conflict", key))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_group(
        &self,
        creator_id: &str,
        participant_ids: &[String],
        title: &str,
    ) -> ChatResult<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::validation("Group title is required"));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(ChatError::validation(format!(
                "Group title must be at most {} characters",
                MAX_TITLE_LEN
            )));
        }
        if participant_ids.is_empty() {
            return Err(ChatError::validation("At least one participant is required"));
        }
        let mut members: BTreeSet<String> = participant_ids
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        members.insert(creator_id.to_string());
        if members.len() < MIN_GROUP_PARTICIPANTS {
            return Err(ChatError::validation(
                "A group needs at least two participants",
            ));
        }
        self.require_active_users(&members).await?;

        let conv = Conversation::new_group(creator_id, members, title.to_string());
        self.stores.conversations.insert_conversation(&conv).await?;
        self.ensure_read_states(&conv).await?;
        info!("group {} created by {}", conv.id, creator_id);
        Ok(conv)
    }

    pub async fn add_participant(
        &self,
        conversation_id: &str,
        actor_id: &str,
        user_id: &str,
    ) -> ChatResult<Conversation> {
        self.require_active_users(&std::iter::once(user_id.to_string()).collect())
            .await?;
        let conv = self
            .mutate(conversation_id, |conv| {
                Self::require_group_admin(conv, actor_id, "add participants")?;
                Ok(conv.participant_ids.insert(user_id.to_string()))
            })
            .await?;
        self.stores.read_states.ensure(&conv.id, user_id).await?;
        Ok(conv)
    }

    pub async fn remove_participant(
        &self,
        conversation_id: &str,
        actor_id: &str,
        user_id: &str,
    ) -> ChatResult<Conversation> {
        if actor_id == user_id {
            return self.leave_group(conversation_id, user_id).await;
        }
        self.mutate(conversation_id, |conv| {
            Self::require_group_admin(conv, actor_id, "remove participants")?;
            if !conv.is_participant(user_id) {
                return Err(ChatError::not_found("User is not a participant"));
            }
            Self::drop_member(conv, user_id)?;
            Ok(true)
        })
        .await
    }

    /// 主动退出群组（无需管理员）/ Leave a group; admin rights not required
    pub async fn leave_group(&self, conversation_id: &str, user_id: &str) -> ChatResult<Conversation> {
        self.mutate(conversation_id, |conv| {
            if conv.is_dm() {
                return Err(ChatError::InvalidOperation(
                    "Cannot leave a direct conversation".to_string(),
                ));
            }
            if !conv.is_participant(user_id) {
                return Err(ChatError::forbidden("Not a participant of this conversation"));
            }
            Self::drop_member(conv, user_id)?;
            Ok(true)
        })
        .await
    }

    pub async fn make_admin(
        &self,
        conversation_id: &str,
        actor_id: &str,
        user_id: &str,
    ) -> ChatResult<Conversation> {
        self.mutate(conversation_id, |conv| {
            Self::require_group_admin(conv, actor_id, "promote participants")?;
            if !conv.is_participant(user_id) {
                return Err(ChatError::not_found("User is not a participant"));
            }
            Ok(conv.admin_ids.insert(user_id.to_string()))
        })
        .await
    }

    pub async fn update_title(
        &self,
        conversation_id: &str,
        actor_id: &str,
        title: &str,
    ) -> ChatResult<Conversation> {
        let title = title.trim();
        if title.is_empty() || title.chars().count() > MAX_TITLE_LEN {
            return Err(ChatError::validation("Invalid group title"));
        }
        self.mutate(conversation_id, |conv| {
            Self::require_group_admin(conv, actor_id, "rename the group")?;
            conv.title = Some(title.to_string());
            Ok(true)
        })
        .await
    }

    /// 按最后活跃时间倒序分页，附带调用者未读数
    /// Page ordered by last activity, annotated with the caller's unread count
    pub async fn get_user_conversations(
        &self,
        user_id: &str,
        limit: Option<usize>,
        before: Option<DateTime<Utc>>,
    ) -> ChatResult<Vec<ConversationSummary>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let list = self
            .stores
            .conversations
            .list_for_user(user_id, limit, before)
            .await?;
        let ids: Vec<String> = list.iter().map(|c| c.id.clone()).collect();
        let counts = self.stores.read_states.unread_counts(user_id, &ids).await?;
        Ok(list
            .into_iter()
            .map(|conversation| ConversationSummary {
                unread_count: counts.get(&conversation.id).copied().unwrap_or(0),
                conversation,
            })
            .collect())
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> ChatResult<Conversation> {
        self.stores
            .conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Conversation not found"))
    }

    pub async fn find_dm(&self, user_a: &str, user_b: &str) -> ChatResult<Option<Conversation>> {
        Ok(self
            .stores
            .conversations
            .find_by_dm_key(&dm_key(user_a, user_b))
            .await?)
    }

    pub async fn get_participant_ids(&self, conversation_id: &str) -> ChatResult<Vec<String>> {
        Ok(self
            .get_conversation(conversation_id)
            .await?
            .participant_ids
            .into_iter()
            .collect())
    }

    pub async fn require_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> ChatResult<Conversation> {
        let conv = self.get_conversation(conversation_id).await?;
        if !conv.is_participant(user_id) {
            return Err(ChatError::forbidden("Not a participant of this conversation"));
        }
        Ok(conv)
    }

    /// 比较并交换修改；闭包返回是否有变更
    /// CAS mutation loop; the closure reports whether anything changed
    async fn mutate<F>(&self, conversation_id: &str, mut apply: F) -> ChatResult<Conversation>
    where
        F: FnMut(&mut Conversation) -> ChatResult<bool> + Send,
    {
        for attempt in 0..CAS_RETRIES {
            let mut conv = self.get_conversation(conversation_id).await?;
            let expected = conv.version;
            if !apply(&mut conv)? {
                return Ok(conv);
            }
            match self
                .stores
                .conversations
                .update_conversation(&conv, expected)
                .await
            {
                Ok(stored) => return Ok(stored),
                Err(StoreError::StaleVersion) => {
                    debug!("conversation {} cas retry {}", conversation_id, attempt + 1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ChatError::Conflict(
            "Conversation was modified concurrently".to_string(),
        ))
    }

    fn require_group_admin(conv: &Conversation, actor_id: &str, action: &str) -> ChatResult<()> {
        if conv.is_dm() {
            return Err(ChatError::InvalidOperation(
                "Participants of a direct conversation cannot change".to_string(),
            ));
        }
        if !conv.is_admin(actor_id) {
            return Err(ChatError::forbidden(format!("Only admins can {}", action)));
        }
        Ok(())
    }

    // 最后一位管理员离开时提升下一位参与者 / promote the next participant when the last admin leaves
    fn drop_member(conv: &mut Conversation, user_id: &str) -> ChatResult<()> {
        if conv.participant_ids.len() <= MIN_GROUP_PARTICIPANTS {
            return Err(ChatError::InvalidOperation(format!(
                "A group needs at least {} participants",
                MIN_GROUP_PARTICIPANTS
            )));
        }
        conv.participant_ids.remove(user_id);
        conv.admin_ids.remove(user_id);
        if conv.admin_ids.is_empty() {
            if let Some(next) = conv.participant_ids.iter().next().cloned() {
                conv.admin_ids.insert(next);
            }
        }
        Ok(())
    }

    async fn require_active_users(&self, ids: &BTreeSet<String>) -> ChatResult<()> {
        let list: Vec<String> = ids.iter().cloned().collect();
        let found = self.stores.users.get_users(&list).await?;
        for id in ids {
            if !found.iter().any(|u| &u.id == id && u.is_active()) {
                return Err(ChatError::not_found(format!("User {} not found", id)));
            }
        }
        Ok(())
    }

    async fn ensure_read_states(&self, conv: &Conversation) -> ChatResult<()> {
        for uid in &conv.participant_ids {
            self.stores.read_states.ensure(&conv.id, uid).await?;
        }
        Ok(())
    }
}
