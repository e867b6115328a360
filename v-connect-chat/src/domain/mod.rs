//! 领域模型 / Domain model
//!
//! 持久化实体（会话、消息、已读游标、用户）与临时实体（在线状态）
//! Durable entities (conversation, message, read-state, user) and ephemeral presence

pub mod conversation;
pub mod event;
pub mod message;
pub mod presence;
pub mod read_state;
pub mod user;

pub use conversation::*;
pub use message::*;
pub use presence::*;
pub use read_state::*;
pub use user::*;

/// 生成新的实体ID / New entity id
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
