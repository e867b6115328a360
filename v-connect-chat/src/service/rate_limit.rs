use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RateLimitPolicies;
use crate::coord::{keys, CoordinationStore};

/// 按事件独立计数、使用默认策略的事件 / Events counted separately under the default policy
const OWN_BUCKET_EVENTS: &[&str] = &[
    "register",
    "signIn",
    "authenticate",
    "signOut",
    "updateProfile",
    "getConversations",
    "editMessage",
    "deleteMessage",
    "deleteMessageForMe",
    "markRead",
    "markDelivered",
    "getFriends",
    "addFriend",
    "removeFriend",
    "createGroup",
    "addParticipant",
    "removeParticipant",
    "leaveGroup",
    "getPresence",
    "muteConversation",
    "unmuteConversation",
    "getTotalUnread",
    "call",
    "answer",
    "reject",
    "hangUp",
    "offer",
    "iceCandidate",
    "answer-webrtc",
];

/// 入站事件到限流桶的映射；`None` 表示不限流，未知事件共用 `default` 桶
/// Map an inbound event to its bucket; `None` means unlimited, unknown events share `default`
pub fn policy_name(event: &str) -> Option<&'static str> {
    match event {
        "heartbeat" => None,
        "chatMessage" => Some("message"),
        "typing" | "stopTyping" => Some("typing"),
        "getChatMessages" | "searchUsers" => Some("search"),
        other => Some(
            OWN_BUCKET_EVENTS
                .iter()
                .copied()
                .find(|name| *name == other)
                .unwrap_or("default"),
        ),
    }
}

/// 共享窗口计数限流，存储不可达时放行
/// Shared fixed-window limiter that fails open
pub struct RateLimiter {
    coord: Arc<dyn CoordinationStore>,
    policies: RateLimitPolicies,
}

impl RateLimiter {
    pub fn new(coord: Arc<dyn CoordinationStore>, policies: RateLimitPolicies) -> Self {
        Self { coord, policies }
    }

    /// 返回是否允许 / Returns whether the event is allowed
    pub async fn check_event_limit(&self, identity: &str, event_type: &str) -> bool {
        let policy = self.policies.policy_for(event_type);
        let key = keys::rate_limit(identity, event_type);
        match self.coord.incr_window(&key, policy.window).await {
            Ok(count) => {
                let allowed = count <= policy.max;
                if !allowed {
                    debug!("rate limited {} on {} ({}/{})", identity, event_type, count, policy.max);
                }
                allowed
            }
            Err(e) => {
                warn!("rate limiter failing open for {}: {}", identity, e);
                true
            }
        }
    }
}
