use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::coord::{keys, CoordinationStore};
use crate::domain::{FriendSummary, User, UserSummary};
use crate::error::{ChatError, ChatResult};
use crate::service::credential::{CredentialVerifier, PasscodeHasher};
use crate::service::media::{MediaKind, MediaStore};
use crate::service::presence::PresenceService;
use crate::service::token::TokenIssuer;
use crate::storage::{StoreError, UserStore};

/// 注册时附带的头像 / Avatar bytes supplied at registration
pub struct AvatarUpload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub original_name: Option<String>,
}

/// 登录结果 / Sign-in result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResult {
    pub user: UserSummary,
    pub token: String,
}

/// 搜索结果上限 / Search result cap
pub const MAX_SEARCH_RESULTS: usize = 20;

/// 登录失败计数，超过阈值后按手机号锁定
/// Failed sign-in counter that locks a phone number past the threshold
pub struct SignInGuard {
    coord: Arc<dyn CoordinationStore>,
    max_failures: i64,
    lockout: Duration,
}

impl SignInGuard {
    pub fn new(coord: Arc<dyn CoordinationStore>, max_failures: i64, lockout: Duration) -> Self {
        Self {
            coord,
            max_failures: max_failures.max(1),
            lockout,
        }
    }

    async fn failures(&self, phone_number: &str) -> ChatResult<i64> {
        Ok(self
            .coord
            .get(&keys::sign_in_failures(phone_number))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn ensure_unlocked(&self, phone_number: &str) -> ChatResult<()> {
        if self.failures(phone_number).await? >= self.max_failures {
            return Err(ChatError::Authentication(format!(
                "Account locked. Try again in {} minutes",
                self.lockout.as_secs().div_ceil(60)
            )));
        }
        Ok(())
    }

    /// 记录一次失败；达到阈值时锁定期从此刻起算
    /// Count a failure; reaching the threshold restarts the lockout window from now
    pub async fn record_failure(&self, phone_number: &str) -> ChatResult<()> {
        let key = keys::sign_in_failures(phone_number);
        let count = self.coord.incr_window(&key, self.lockout).await?;
        if count == self.max_failures {
            self.coord.expire(&key, self.lockout).await?;
            warn!("🔒 Sign-in locked for {} after {} failures", phone_number, count);
        }
        Ok(())
    }

    pub async fn reset(&self, phone_number: &str) -> ChatResult<()> {
        Ok(self.coord.del(&keys::sign_in_failures(phone_number)).await?)
    }
}

pub struct UserService {
    users: Arc<dyn UserStore>,
    verifier: Arc<dyn CredentialVerifier>,
    hasher: PasscodeHasher,
    guard: SignInGuard,
    tokens: TokenIssuer,
    media: Arc<dyn MediaStore>,
    presence: Arc<PresenceService>,
}

fn invalid_credentials() -> ChatError {
    ChatError::Authentication("Invalid credentials".to_string())
}

impl UserService {
    pub fn new(
        users: Arc<dyn UserStore>,
        verifier: Arc<dyn CredentialVerifier>,
        hasher: PasscodeHasher,
        guard: SignInGuard,
        tokens: TokenIssuer,
        media: Arc<dyn MediaStore>,
        presence: Arc<PresenceService>,
    ) -> Self {
        Self {
            users,
            verifier,
            hasher,
            guard,
            tokens,
            media,
            presence,
        }
    }

    pub async fn register(
        &self,
        phone_number: &str,
        username: &str,
        passcode: &str,
        avatar: Option<AvatarUpload>,
    ) -> ChatResult<UserSummary> {
        let (phone_number, username) = (phone_number.trim(), username.trim());
        if phone_number.is_empty() || username.is_empty() || passcode.is_empty() {
            return Err(ChatError::validation("All fields are required"));
        }
        if self.users.find_by_phone(phone_number).await?.is_some() {
            return Err(ChatError::Conflict("Phone number already registered".to_string()));
        }
        let mut user = User::new(phone_number, username, self.hasher.hash(passcode)?);
        if let Some(avatar) = avatar {
            let media = self
                .media
                .save(
                    &avatar.bytes,
                    &avatar.mime_type,
                    avatar.original_name.as_deref(),
                    &user.id,
                    MediaKind::Avatar,
                )
                .await?;
            user.avatar_media_id = Some(media.id);
        }
        match self.users.insert_user(&user).await {
            Ok(()) => {
                info!("registered user {}", user.id);
                Ok(user.summary())
            }
            Err(StoreError::Conflict(_)) => {
                Err(ChatError::Conflict("Phone number already registered".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 手机号 + 用户名 + 口令登录，签发令牌 / Sign in and issue a bearer token
    pub async fn sign_in(
        &self,
        phone_number: &str,
        username: &str,
        passcode: &str,
    ) -> ChatResult<(User, SignInResult)> {
        if phone_number.trim().is_empty() || username.trim().is_empty() || passcode.is_empty() {
            return Err(ChatError::validation("All fields are required"));
        }
        let phone_number = phone_number.trim();
        self.guard.ensure_unlocked(phone_number).await?;
        let user = self
            .users
            .find_by_phone(phone_number)
            .await?
            .filter(|u| u.is_active() && u.username == username.trim())
            .filter(|u| self.verifier.verify(u, passcode));
        let Some(user) = user else {
            self.guard.record_failure(phone_number).await?;
            return Err(invalid_credentials());
        };
        self.guard.reset(phone_number).await?;
        let token = self.tokens.issue(&user.id, &user.phone_number)?;
        let result = SignInResult {
            user: user.summary(),
            token,
        };
        Ok((user, result))
    }

    /// 以令牌恢复会话 / Resume a session from a bearer token
    pub async fn authenticate_token(&self, token: &str) -> ChatResult<User> {
        let claims = self.tokens.verify(token)?;
        self.users
            .get_user(&claims.sub)
            .await?
            .filter(User::is_active)
            .ok_or_else(|| ChatError::Authentication("Invalid or expired token".to_string()))
    }

    pub async fn update_profile(
        &self,
        user_id: &str,
        username: Option<&str>,
        avatar_media_id: Option<&str>,
    ) -> ChatResult<UserSummary> {
        let username = username.map(str::trim);
        if username.map_or(false, str::is_empty) {
            return Err(ChatError::validation("Username cannot be empty"));
        }
        if username.is_none() && avatar_media_id.is_none() {
            return Err(ChatError::validation("Nothing to update"));
        }
        if let Some(media_id) = avatar_media_id {
            if self.media.metadata(media_id).await?.is_none() {
                return Err(ChatError::not_found("Avatar not found"));
            }
        }
        Ok(self
            .users
            .update_profile(user_id, username, avatar_media_id)
            .await?
            .summary())
    }

    pub async fn get_user(&self, user_id: &str) -> ChatResult<User> {
        self.users
            .get_user(user_id)
            .await?
            .filter(User::is_active)
            .ok_or_else(|| ChatError::not_found("User not found"))
    }

    pub async fn find_by_phone(&self, phone_number: &str) -> ChatResult<User> {
        self.users
            .find_by_phone(phone_number.trim())
            .await?
            .filter(User::is_active)
            .ok_or_else(|| ChatError::not_found("User not found"))
    }

    pub async fn add_friend(&self, user_id: &str, friend_phone: &str) -> ChatResult<(User, FriendSummary)> {
        let me = self.get_user(user_id).await?;
        let friend = self.find_by_phone(friend_phone).await?;
        if friend.id == me.id {
            return Err(ChatError::InvalidArgument("Cannot add yourself".to_string()));
        }
        if me.friend_ids.contains(&friend.id) {
            return Err(ChatError::InvalidOperation("Already friends".to_string()));
        }
        self.users.add_friendship(&me.id, &friend.id).await?;
        let summary = FriendSummary {
            user: friend.summary(),
            is_online: self.presence.is_online(&friend.id).await,
        };
        Ok((me, summary))
    }

    pub async fn remove_friend(&self, user_id: &str, friend_id: &str) -> ChatResult<User> {
        let me = self.get_user(user_id).await?;
        if !me.friend_ids.contains(friend_id) {
            return Err(ChatError::not_found("Friend not found"));
        }
        self.users.remove_friendship(&me.id, friend_id).await?;
        Ok(me)
    }

    /// 按用户名或手机号搜索（排除自己）/ Search users by name or phone, excluding the caller
    pub async fn search(&self, query: &str, caller_id: &str) -> ChatResult<Vec<FriendSummary>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ChatError::validation("Search term is required"));
        }
        let found: Vec<User> = self
            .users
            .search_users(query, MAX_SEARCH_RESULTS + 1)
            .await?
            .into_iter()
            .filter(|u| u.id != caller_id)
            .take(MAX_SEARCH_RESULTS)
            .collect();
        let ids: Vec<String> = found.iter().map(|u| u.id.clone()).collect();
        let presence = self.presence.get_presence_batch(&ids).await;
        Ok(found
            .into_iter()
            .map(|u| {
                let is_online = presence.iter().any(|p| p.user_id == u.id && p.is_online());
                FriendSummary {
                    user: u.summary(),
                    is_online,
                }
            })
            .collect())
    }

    /// 好友列表（附在线状态）/ Friends with online flags
    pub async fn get_friends(&self, user_id: &str) -> ChatResult<Vec<FriendSummary>> {
        let me = self.get_user(user_id).await?;
        let ids: Vec<String> = me.friend_ids.iter().cloned().collect();
        let friends = self.users.get_users(&ids).await?;
        let presence = self.presence.get_presence_batch(&ids).await;
        Ok(friends
            .into_iter()
            .filter(User::is_active)
            .map(|f| {
                let is_online = presence
                    .iter()
                    .any(|p| p.user_id == f.id && p.is_online());
                FriendSummary {
                    user: f.summary(),
                    is_online,
                }
            })
            .collect())
    }
}
