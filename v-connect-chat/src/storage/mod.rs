//! 持久化存储 / Durable stores
//!
//! 会话、消息、已读游标与用户四类存储接口，内存与 PostgreSQL 两套实现
//! Conversation, message, read-state and user store traits with memory and PostgreSQL backends

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use v::HealthCheck;

use crate::domain::{
    Conversation, CursorUpdate, Message, MessagePosition, MessageQuery, ReadState, User,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// 唯一键冲突 / Unique-key violation
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// 乐观锁版本不匹配 / Compare-and-swap lost
    #[error("stale version")]
    StaleVersion,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if v::is_unique_violation(&err) {
            return StoreError::Conflict(err.to_string());
        }
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<v::DbError> for StoreError {
    fn from(err: v::DbError) -> Self {
        match err {
            v::DbError::Sqlx(e) => e.into(),
            v::DbError::NotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Unavailable(v::describe_error(&other)),
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 新建会话；单聊 dmKey 重复时返回 Conflict / Insert; duplicate dmKey yields Conflict
    async fn insert_conversation(&self, conv: &Conversation) -> StoreResult<()>;
    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>>;
    async fn find_by_dm_key(&self, dm_key: &str) -> StoreResult<Option<Conversation>>;
    /// 比较并交换：仅当存储版本等于 `expected_version` 时写入，版本置为 expected+1
    /// Compare-and-swap on `version`; stores `expected_version + 1` on success
    async fn update_conversation(
        &self,
        conv: &Conversation,
        expected_version: i64,
    ) -> StoreResult<Conversation>;
    /// 原子更新最后消息缓存（只前进）/ Atomically advance the last-message cache
    async fn touch_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
        preview: &str,
    ) -> StoreResult<()>;
    /// 按活跃时间倒序 / Ordered by last activity, newest first
    async fn list_for_user(
        &self,
        user_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Conversation>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 插入消息并分配序号；幂等键重复时返回 Conflict
    /// Insert and assign `seq`; a repeated idempotency key yields Conflict
    async fn insert_message(&self, msg: Message) -> StoreResult<Message>;
    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>>;
    async fn find_by_client_id(
        &self,
        conversation_id: &str,
        sender_id: &str,
        client_message_id: &str,
    ) -> StoreResult<Option<Message>>;
    async fn update_message_text(
        &self,
        id: &str,
        text: &str,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<Message>;
    /// 全局墓碑，重复调用保留首次时间 / Global tombstone, keeps the first deletion time
    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> StoreResult<Message>;
    async fn hide_for_user(&self, id: &str, user_id: &str) -> StoreResult<Message>;
    async fn list_messages(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        query: &MessageQuery,
    ) -> StoreResult<Vec<Message>>;
}

#[async_trait]
pub trait ReadStateStore: Send + Sync {
    async fn ensure(&self, conversation_id: &str, user_id: &str) -> StoreResult<ReadState>;
    async fn get(&self, conversation_id: &str, user_id: &str) -> StoreResult<Option<ReadState>>;
    /// 为除发送者外的每个参与者原子加一 / Atomic +1 for every participant except the sender
    async fn increment_unread(
        &self,
        conversation_id: &str,
        sender_id: &str,
        participant_ids: &[String],
    ) -> StoreResult<()>;
    /// 仅当 `pos` 严格晚于当前 (createdAt, seq) 游标时推进
    /// Advance only when `pos` is strictly after the stored (createdAt, seq) cursor
    async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
        pos: MessagePosition,
    ) -> StoreResult<CursorUpdate>;
    async fn mark_delivered(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
        pos: MessagePosition,
    ) -> StoreResult<CursorUpdate>;
    async fn unread_counts(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> StoreResult<HashMap<String, i64>>;
    /// 设置免打扰（不存在则创建）；取消时清空截止时间
    /// Upsert the mute flag; unmuting clears `muted_until`
    async fn set_muted(
        &self,
        conversation_id: &str,
        user_id: &str,
        muted: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<ReadState>;
    /// 未免打扰会话的未读总数 / Sum of unread counts over conversations not muted at `now`
    async fn total_unread(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<i64>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// 手机号重复时返回 Conflict / Duplicate phone yields Conflict
    async fn insert_user(&self, user: &User) -> StoreResult<()>;
    async fn get_user(&self, id: &str) -> StoreResult<Option<User>>;
    async fn find_by_phone(&self, phone_number: &str) -> StoreResult<Option<User>>;
    async fn get_users(&self, ids: &[String]) -> StoreResult<Vec<User>>;
    async fn update_profile(
        &self,
        id: &str,
        username: Option<&str>,
        avatar_media_id: Option<&str>,
    ) -> StoreResult<User>;
    /// 双向好友关系 / Symmetric friendship
    async fn add_friendship(&self, user_id: &str, friend_id: &str) -> StoreResult<()>;
    async fn remove_friendship(&self, user_id: &str, friend_id: &str) -> StoreResult<()>;
    /// 用户名或手机号的不区分大小写子串匹配，仅活跃用户
    /// Case-insensitive substring match on username or phone, active users only
    async fn search_users(&self, query: &str, limit: usize) -> StoreResult<Vec<User>>;
}

/// 存储集合 / Store bundle handed to the services
#[derive(Clone)]
pub struct Stores {
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
    pub read_states: Arc<dyn ReadStateStore>,
    pub users: Arc<dyn UserStore>,
    pub health: Arc<dyn HealthCheck + Send + Sync>,
}

impl Stores {
    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }

    pub fn postgres(store: PgStore) -> Self {
        Self::from_backend(Arc::new(store))
    }

    fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: ConversationStore
            + MessageStore
            + ReadStateStore
            + UserStore
            + HealthCheck
            + Send
            + Sync
            + 'static,
    {
        Self {
            conversations: store.clone(),
            messages: store.clone(),
            read_states: store.clone(),
            users: store.clone(),
            health: store,
        }
    }
}
