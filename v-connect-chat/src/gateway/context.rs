use chrono::{DateTime, Utc};

use crate::domain::User;

/// 连接鉴权上下文，仅在鉴权时写入一次
/// Per-connection identity, written exactly once at authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub user_id: String,
    pub phone_number: String,
    pub authenticated_at: DateTime<Utc>,
}

impl ConnectionContext {
    pub fn for_user(user: &User) -> Self {
        Self {
            user_id: user.id.clone(),
            phone_number: user.phone_number.clone(),
            authenticated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_copies_identity() {
        let user = User::new("555", "alice", "salt$00".to_string());
        let ctx = ConnectionContext::for_user(&user);
        assert_eq!(ctx.user_id, user.id);
        assert_eq!(ctx.phone_number, "555");
    }
}
