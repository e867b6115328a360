//! 业务服务层 / Service layer
//!
//! 不变量在此强制执行：会话身份、幂等发送、游标单调、在线引用计数、限流
//! Invariants live here: conversation identity, idempotent sends, monotonic cursors,
//! ref-counted presence and rate limiting

pub mod call;
pub mod conversation;
pub mod credential;
pub mod events;
pub mod media;
pub mod message;
pub mod presence;
pub mod rate_limit;
pub mod token;
pub mod typing;
pub mod user;

use std::sync::Arc;

use crate::config::ChatConfig;
use crate::coord::CoordinationStore;
use crate::storage::Stores;

pub use call::CallService;
pub use conversation::ConversationService;
pub use credential::{CredentialVerifier, HashedPasscodeVerifier, PasscodeHasher};
pub use events::{EventPublisher, NoopPublisher, OutboundEvent, WebhookPublisher};
pub use media::{LocalMediaStore, MediaKind, MediaRef, MediaStore};
pub use message::MessageService;
pub use presence::PresenceService;
pub use rate_limit::RateLimiter;
pub use token::TokenIssuer;
pub use typing::TypingService;
pub use user::{SignInGuard, UserService};

/// 服务集合 / Service bundle shared by the gateway and HTTP API
#[derive(Clone)]
pub struct Services {
    pub stores: Stores,
    pub coord: Arc<dyn CoordinationStore>,
    pub media: Arc<dyn MediaStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub conversations: Arc<ConversationService>,
    pub messages: Arc<MessageService>,
    pub presence: Arc<PresenceService>,
    pub typing: Arc<TypingService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub users: Arc<UserService>,
    pub calls: Arc<CallService>,
}

impl Services {
    pub fn new(
        cfg: &ChatConfig,
        stores: Stores,
        coord: Arc<dyn CoordinationStore>,
        media: Arc<dyn MediaStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let conversations = Arc::new(ConversationService::new(stores.clone()));
        let messages = Arc::new(MessageService::new(
            stores.clone(),
            conversations.clone(),
            publisher.clone(),
        ));
        let presence = Arc::new(PresenceService::new(coord.clone(), cfg.presence.clone()));
        let typing = Arc::new(TypingService::new(
            coord.clone(),
            conversations.clone(),
            cfg.typing_ttl,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(coord.clone(), cfg.rate_limits.clone()));
        let hasher = PasscodeHasher::from_config(&cfg.auth);
        let users = Arc::new(UserService::new(
            stores.users.clone(),
            Arc::new(HashedPasscodeVerifier::new(hasher.clone())),
            hasher,
            SignInGuard::new(coord.clone(), cfg.auth.max_sign_in_failures, cfg.auth.lockout),
            TokenIssuer::new(&cfg.auth.jwt_secret, cfg.auth.token_ttl),
            media.clone(),
            presence.clone(),
        ));
        let calls = Arc::new(CallService::new(
            stores.users.clone(),
            presence.clone(),
            publisher.clone(),
        ));
        Self {
            stores,
            coord,
            media,
            publisher,
            conversations,
            messages,
            presence,
            typing,
            rate_limiter,
            users,
            calls,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use super::*;
    use crate::coord::MemoryCoordStore;
    use crate::domain::User;

    pub fn stores() -> Stores {
        Stores::memory()
    }

    /// 以手机号建用户，返回ID / Seed a user and return its id
    pub async fn seed_user(stores: &Stores, phone: &str) -> String {
        let user = User::new(
            phone,
            &format!("user{}", phone),
            test_hasher().hash("pass").unwrap(),
        );
        stores.users.insert_user(&user).await.unwrap();
        user.id
    }

    /// 低成本 KDF，仅测试使用 / Cheap KDF parameters for tests
    pub fn test_hasher() -> PasscodeHasher {
        PasscodeHasher::new(1024, 1)
    }

    pub fn user_service() -> (UserService, Arc<MemoryCoordStore>, tempfile::TempDir) {
        let cfg = ChatConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        let mut media_cfg = cfg.media.clone();
        media_cfg.dir = tmp.path().to_string_lossy().to_string();
        let coord = Arc::new(MemoryCoordStore::new());
        let presence = Arc::new(PresenceService::new(coord.clone(), cfg.presence.clone()));
        let svc = UserService::new(
            stores().users,
            Arc::new(HashedPasscodeVerifier::new(test_hasher())),
            test_hasher(),
            SignInGuard::new(coord.clone(), cfg.auth.max_sign_in_failures, cfg.auth.lockout),
            TokenIssuer::new("test-secret", cfg.auth.token_ttl),
            Arc::new(LocalMediaStore::new(&media_cfg)),
            presence,
        );
        (svc, coord, tmp)
    }
}
