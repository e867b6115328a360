use std::sync::Arc;

use serde_json::json;

use crate::domain::User;
use crate::error::{ChatError, ChatResult};
use crate::service::events::{publish_detached, EventPublisher, OutboundEvent};
use crate::service::presence::PresenceService;
use crate::storage::UserStore;

/// 呼叫发起结果 / Call set-up result
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub receiver: User,
}

/// 通话信令中转（无状态）/ Stateless call signalling relay
pub struct CallService {
    users: Arc<dyn UserStore>,
    presence: Arc<PresenceService>,
    publisher: Arc<dyn EventPublisher>,
}

impl CallService {
    pub fn new(
        users: Arc<dyn UserStore>,
        presence: Arc<PresenceService>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            users,
            presence,
            publisher,
        }
    }

    async fn user_by_phone(&self, phone: &str) -> ChatResult<User> {
        self.users
            .find_by_phone(phone.trim())
            .await?
            .filter(User::is_active)
            .ok_or_else(|| ChatError::not_found("User not found"))
    }

    fn publish(&self, event_type: &str, data: serde_json::Value) {
        publish_detached(self.publisher.clone(), OutboundEvent::new(event_type, data));
    }

    pub async fn initiate(&self, caller_id: &str, receiver_phone: &str) -> ChatResult<CallSession> {
        let receiver = self.user_by_phone(receiver_phone).await?;
        if receiver.id == caller_id {
            return Err(ChatError::InvalidArgument("Cannot call yourself".to_string()));
        }
        if !self.presence.is_online(&receiver.id).await {
            return Err(ChatError::InvalidOperation("User is not online".to_string()));
        }
        let call_id = format!("call_{}_{}", chrono::Utc::now().timestamp_millis(), caller_id);
        self.publish(
            "call.initiated",
            json!({"callId": call_id, "callerId": caller_id, "receiverId": receiver.id}),
        );
        Ok(CallSession { call_id, receiver })
    }

    /// 返回主叫用户 / Returns the caller
    pub async fn answer(&self, answerer_id: &str, caller_phone: &str, call_id: &str) -> ChatResult<User> {
        let caller = self.user_by_phone(caller_phone).await?;
        self.publish(
            "call.answered",
            json!({"callId": call_id, "callerId": caller.id, "receiverId": answerer_id}),
        );
        Ok(caller)
    }

    pub async fn reject(&self, rejecter_id: &str, caller_phone: &str, call_id: &str) -> ChatResult<User> {
        let caller = self.user_by_phone(caller_phone).await?;
        self.publish(
            "call.rejected",
            json!({"callId": call_id, "callerId": caller.id, "receiverId": rejecter_id}),
        );
        Ok(caller)
    }

    /// 返回（主叫，被叫）/ Returns (caller, receiver)
    pub async fn hang_up(
        &self,
        actor_id: &str,
        call_id: &str,
        caller_phone: &str,
        receiver_phone: &str,
    ) -> ChatResult<(User, User)> {
        let caller = self.user_by_phone(caller_phone).await?;
        let receiver = self.user_by_phone(receiver_phone).await?;
        if actor_id != caller.id && actor_id != receiver.id {
            return Err(ChatError::forbidden("Not a party to this call"));
        }
        self.publish(
            "call.ended",
            json!({"callId": call_id, "callerId": caller.id, "receiverId": receiver.id, "endedBy": actor_id}),
        );
        Ok((caller, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordStore;
    use crate::service::events::NoopPublisher;
    use crate::service::testing::{seed_user, stores};

    #[tokio::test]
    async fn test_call_requires_online_receiver() {
        let stores = stores();
        let a = seed_user(&stores, "100").await;
        let b = seed_user(&stores, "200").await;
        let presence = Arc::new(PresenceService::new(
            Arc::new(MemoryCoordStore::new()),
            crate::config::ChatConfig::default().presence,
        ));
        let calls = CallService::new(stores.users.clone(), presence.clone(), Arc::new(NoopPublisher));

        let err = calls.initiate(&a, "200").await.unwrap_err();
        assert_eq!(err.to_string(), "User is not online");

        presence.set_online(&b, "n:c1").await.unwrap();
        let session = calls.initiate(&a, "200").await.unwrap();
        assert!(session.call_id.starts_with("call_"));
        assert!(session.call_id.ends_with(&a));
        assert_eq!(session.receiver.id, b);

        let caller = calls.answer(&b, "100", &session.call_id).await.unwrap();
        assert_eq!(caller.id, a);
        assert_eq!(
            calls.hang_up("stranger", &session.call_id, "100", "200").await.unwrap_err().code(),
            "FORBIDDEN"
        );
        assert!(calls.hang_up(&b, &session.call_id, "100", "200").await.is_ok());
    }
}
