use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::domain::event::*;
use crate::domain::{
    Conversation, FriendSummary, Message, MessagePosition, MessageQuery, MessageType, NewMessage,
    ReadState, SendOutcome, User,
};
use crate::error::{ChatError, ChatResult};
use crate::gateway::{ChatGateway, Connection, ConnectionContext};
use crate::service::rate_limit::policy_name;
use crate::service::user::AvatarUpload;
use crate::service::MediaKind;

/// 通知预览长度 / Notification preview length
const NOTIFICATION_PREVIEW_LEN: usize = 50;
/// 单次在线查询上限 / Max ids per presence query
const MAX_PRESENCE_BATCH: usize = 200;

/// 入站事件对应的错误事件名 / Error event name for an inbound event
pub fn error_event_name(event: &str) -> String {
    match event {
        "register" => "registrationError".to_string(),
        "call" | "answer" | "reject" | "hangUp" => "callError".to_string(),
        other => format!("{}Error", other),
    }
}

fn parse<T: DeserializeOwned>(event: &ChatEvent) -> ChatResult<T> {
    event
        .payload()
        .map_err(|e| ChatError::validation(format!("Invalid {} payload: {}", event.event, e)))
}

fn notification_preview(text: &str) -> String {
    if text.is_empty() {
        "Media message".to_string()
    } else {
        text.chars().take(NOTIFICATION_PREVIEW_LEN).collect()
    }
}

fn insert_field(value: &mut Value, key: &str, field: Value) {
    if let Value::Object(map) = value {
        map.insert(key.to_string(), field);
    }
}

impl ChatGateway {
    /// 处理一条入站文本帧 / Handle one inbound text frame
    pub async fn handle_text(&self, conn: &Arc<Connection>, text: &str) {
        conn.touch();
        let event: ChatEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                debug!("Malformed frame from {}: {}", conn.id, e);
                conn.send_event(&ChatEvent::new(
                    "error",
                    ChatError::validation("Invalid message format").payload(),
                ));
                return;
            }
        };
        debug!("📨 {} from {}", event.event, conn.id);

        if let Some(policy) = policy_name(&event.event) {
            let identity = conn.user_id().unwrap_or(&conn.id).to_string();
            if !self
                .services
                .rate_limiter
                .check_event_limit(&identity, policy)
                .await
            {
                self.reply_error(conn, &event.event, &ChatError::RateLimited);
                return;
            }
        }

        if let Err(err) = self.dispatch(conn, &event).await {
            debug!("{} from {} failed: {}", event.event, conn.id, err);
            self.reply_error(conn, &event.event, &err);
        }
    }

    fn reply_error(&self, conn: &Connection, event: &str, err: &ChatError) {
        if let ChatError::Infrastructure(msg) = err {
            warn!("⚠️  {} failed on infrastructure: {}", event, msg);
        }
        conn.send_event(&ChatEvent::new(&error_event_name(event), err.payload()));
    }

    async fn dispatch(&self, conn: &Arc<Connection>, event: &ChatEvent) -> ChatResult<()> {
        match event.event.as_str() {
            "register" => self.on_register(conn, parse(event)?).await,
            "signIn" => self.on_sign_in(conn, parse(event)?).await,
            "authenticate" => self.on_authenticate(conn, parse(event)?).await,
            "heartbeat" => {
                self.on_heartbeat(conn).await;
                Ok(())
            }
            _ => {
                let ctx = conn.context().cloned().ok_or(ChatError::NotAuthenticated)?;
                self.dispatch_authenticated(conn, &ctx, event).await
            }
        }
    }

    async fn dispatch_authenticated(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        event: &ChatEvent,
    ) -> ChatResult<()> {
        match event.event.as_str() {
            "signOut" => self.on_sign_out(conn).await,
            "updateProfile" => self.on_update_profile(conn, ctx, parse(event)?).await,
            "chatMessage" => self.on_chat_message(conn, ctx, parse(event)?).await,
            "getChatMessages" => self.on_get_chat_messages(conn, ctx, parse(event)?).await,
            "getConversations" => self.on_get_conversations(conn, ctx, parse(event)?).await,
            "editMessage" => self.on_edit_message(conn, ctx, parse(event)?).await,
            "deleteMessage" => self.on_delete_message(conn, ctx, parse(event)?).await,
            "deleteMessageForMe" => self.on_delete_for_me(conn, ctx, parse(event)?).await,
            "markRead" => self.on_mark_read(conn, ctx, parse(event)?).await,
            "markDelivered" => self.on_mark_delivered(conn, ctx, parse(event)?).await,
            "muteConversation" => self.on_mute(conn, ctx, parse(event)?).await,
            "unmuteConversation" => self.on_unmute(conn, ctx, parse(event)?).await,
            "getTotalUnread" => self.on_get_total_unread(conn, ctx).await,
            "typing" => self.on_typing(ctx, parse(event)?, true).await,
            "stopTyping" => self.on_typing(ctx, parse(event)?, false).await,
            "getFriends" => self.on_get_friends(conn, ctx).await,
            "addFriend" => self.on_add_friend(conn, ctx, parse(event)?).await,
            "removeFriend" => self.on_remove_friend(conn, ctx, parse(event)?).await,
            "searchUsers" => self.on_search_users(conn, ctx, parse(event)?).await,
            "createGroup" => self.on_create_group(conn, ctx, parse(event)?).await,
            "addParticipant" => self.on_add_participant(conn, ctx, parse(event)?).await,
            "removeParticipant" => self.on_remove_participant(conn, ctx, parse(event)?).await,
            "leaveGroup" => self.on_leave_group(conn, ctx, parse(event)?).await,
            "getPresence" => self.on_get_presence(conn, parse(event)?).await,
            "call" => self.on_call(conn, ctx, parse(event)?).await,
            "answer" => self.on_answer(conn, ctx, parse(event)?).await,
            "reject" => self.on_reject(conn, ctx, parse(event)?).await,
            "hangUp" => self.on_hang_up(conn, ctx, parse(event)?).await,
            "offer" | "iceCandidate" | "answer-webrtc" => {
                self.on_signal(conn, &event.event, parse(event)?).await
            }
            other => Err(ChatError::InvalidOperation(format!("Unknown event: {}", other))),
        }
    }

    /* ---------------------------- 身份 / identity ---------------------------- */

    /// 绑定身份、加入用户组、登记在线 / Bind identity, join the user group, mark online
    async fn bind_identity(&self, conn: &Arc<Connection>, user: &User) -> ChatResult<()> {
        conn.bind(ConnectionContext::for_user(user))?;
        self.join_user_group(&user.id, &conn.id);
        if let Err(e) = self.services.presence.set_online(&user.id, &conn.id).await {
            warn!("⚠️  presence unavailable for {}: {}", user.id, e);
        }
        info!("🔐 Connection {} authenticated as {}", conn.id, user.id);
        Ok(())
    }

    async fn announce_online(&self, user: &User) {
        self.broadcast(&ChatEvent::new(
            "userOnline",
            json!({"userId": user.id, "phoneNumber": user.phone_number}),
        ))
        .await;
    }

    fn require_anonymous(conn: &Connection) -> ChatResult<()> {
        if conn.is_authenticated() {
            return Err(ChatError::validation("Already authenticated"));
        }
        Ok(())
    }

    async fn on_register(&self, conn: &Arc<Connection>, p: RegisterPayload) -> ChatResult<()> {
        let avatar = p.avatar.map(|file| AvatarUpload {
            bytes: file.buffer,
            mime_type: file.mimetype.unwrap_or_else(|| "image/jpeg".to_string()),
            original_name: file.originalname,
        });
        let user = self
            .services
            .users
            .register(&p.phone_number, &p.username, &p.passcode, avatar)
            .await?;
        conn.send_event(&ChatEvent::new("registrationSuccess", json!({"user": user})));
        Ok(())
    }

    async fn on_sign_in(&self, conn: &Arc<Connection>, p: SignInPayload) -> ChatResult<()> {
        Self::require_anonymous(conn)?;
        let (user, result) = self
            .services
            .users
            .sign_in(&p.phone_number, &p.username, &p.passcode)
            .await?;
        self.bind_identity(conn, &user).await?;
        conn.send_event(&ChatEvent::new("signInSuccess", &result));
        self.announce_online(&user).await;
        Ok(())
    }

    async fn on_authenticate(&self, conn: &Arc<Connection>, p: AuthenticatePayload) -> ChatResult<()> {
        Self::require_anonymous(conn)?;
        let user = self.services.users.authenticate_token(&p.token).await?;
        self.bind_identity(conn, &user).await?;
        conn.send_event(&ChatEvent::new(
            "authenticateSuccess",
            json!({"user": user.summary()}),
        ));
        self.announce_online(&user).await;
        Ok(())
    }

    async fn on_heartbeat(&self, conn: &Arc<Connection>) {
        if let Some(user_id) = conn.user_id() {
            if let Err(e) = self.services.presence.heartbeat(user_id, &conn.id).await {
                warn!("⚠️  heartbeat not recorded for {}: {}", conn.id, e);
            }
        }
    }

    async fn on_sign_out(&self, conn: &Arc<Connection>) -> ChatResult<()> {
        conn.send_event(&ChatEvent::new("signOutSuccess", json!({})));
        self.send_close(&conn.id, "Signed out");
        self.disconnect(&conn.id).await;
        Ok(())
    }

    async fn on_update_profile(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: UpdateProfilePayload,
    ) -> ChatResult<()> {
        let user = self
            .services
            .users
            .update_profile(&ctx.user_id, p.username.as_deref(), p.avatar_media_id.as_deref())
            .await?;
        conn.send_event(&ChatEvent::new("updateProfileSuccess", json!({"user": user})));
        Ok(())
    }

    /* ---------------------------- 消息 / messages ---------------------------- */

    /// 消息视图，附带媒体地址 / Message view enriched with media `{url, mimeType}`
    pub async fn message_view(&self, message: &Message) -> Value {
        let mut value = serde_json::to_value(message).unwrap_or(Value::Null);
        if let Some(media_id) = &message.media_ref {
            if let Ok(Some(meta)) = self.services.media.metadata(media_id).await {
                insert_field(
                    &mut value,
                    "media",
                    json!({"url": meta.url, "mimeType": meta.mime_type}),
                );
            }
        }
        value
    }

    /// 新消息扇出（重复发送不扇出）/ Fan a new message out; duplicates are not re-delivered
    pub async fn fan_out_new_message(
        &self,
        sender_id: &str,
        sender_phone: &str,
        outcome: &SendOutcome,
        conversation: &Conversation,
        view: &Value,
    ) {
        if outcome.is_duplicate {
            return;
        }
        let recipients = conversation.other_participants(sender_id);
        self.emit_to_users(&recipients, &ChatEvent::new("newMessage", view))
            .await;
        let notification = json!({
            "type": "message",
            "sender": sender_phone,
            "conversationId": conversation.id,
            "preview": notification_preview(&outcome.message.text),
        });
        self.emit_to_users(&recipients, &ChatEvent::new("newNotification", notification))
            .await;
    }

    /// 单聊按手机号、群聊按会话ID发送 / Send by receiver phone (DM) or conversation id
    pub async fn send_chat_message(
        &self,
        ctx: &ConnectionContext,
        receiver: Option<&str>,
        conversation_id: Option<&str>,
        draft: NewMessage,
    ) -> ChatResult<(SendOutcome, Conversation, Value)> {
        let (outcome, conversation) = match (receiver.map(str::trim), conversation_id) {
            (Some(receiver), _) if !receiver.is_empty() => {
                self.services.messages.send_direct(receiver, draft).await?
            }
            (_, Some(conversation_id)) if !conversation_id.trim().is_empty() => {
                let mut draft = draft;
                draft.conversation_id = conversation_id.to_string();
                let outcome = self.services.messages.send_message(draft).await?;
                let conversation = self
                    .services
                    .conversations
                    .get_conversation(conversation_id)
                    .await?;
                (outcome, conversation)
            }
            _ => return Err(ChatError::validation("Receiver or conversationId is required")),
        };
        let mut view = self.message_view(&outcome.message).await;
        insert_field(&mut view, "senderPhone", json!(ctx.phone_number));
        if let Some(receiver) = receiver {
            insert_field(&mut view, "receiverPhone", json!(receiver.trim()));
        }
        insert_field(&mut view, "isDuplicate", json!(outcome.is_duplicate));
        self.fan_out_new_message(&ctx.user_id, &ctx.phone_number, &outcome, &conversation, &view)
            .await;
        Ok((outcome, conversation, view))
    }

    async fn on_chat_message(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: ChatMessagePayload,
    ) -> ChatResult<()> {
        let mut message_type = p.message_type.unwrap_or(MessageType::Text);
        let mut media_ref = None;
        if let Some(file) = p.media_file {
            let mime_type = file.mimetype.unwrap_or_else(|| "image/jpeg".to_string());
            let media = self
                .services
                .media
                .save(
                    &file.buffer,
                    &mime_type,
                    file.originalname.as_deref(),
                    &ctx.user_id,
                    MediaKind::Message,
                )
                .await?;
            media_ref = Some(media.id);
            message_type = MessageType::Image;
        }
        let draft = NewMessage {
            conversation_id: String::new(),
            sender_id: ctx.user_id.clone(),
            message_type,
            text: p.message,
            media_ref,
            reply_to: p.reply_to,
            client_message_id: p.client_message_id,
        };
        let (outcome, _, view) = self
            .send_chat_message(ctx, p.receiver.as_deref(), p.conversation_id.as_deref(), draft)
            .await?;
        conn.send_event(&ChatEvent::new("chatMessageSuccess", &view));
        info!(
            "💬 Message {} from {} (duplicate: {})",
            outcome.message.id, ctx.user_id, outcome.is_duplicate
        );
        Ok(())
    }

    async fn on_get_chat_messages(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: GetChatMessagesPayload,
    ) -> ChatResult<()> {
        if let Some(phone) = p.user_phone_number.as_deref() {
            if !phone.trim().is_empty() && phone.trim() != ctx.phone_number {
                return Err(ChatError::forbidden("Cannot read another user's messages"));
            }
        }
        let mut query = MessageQuery::by_time(p.limit, p.before, p.after);
        if let Some(id) = p.before_message_id.as_deref().filter(|id| !id.is_empty()) {
            query.before = Some(self.anchor(id, ctx).await?);
        }
        if let Some(id) = p.after_message_id.as_deref().filter(|id| !id.is_empty()) {
            query.after = Some(self.anchor(id, ctx).await?);
        }
        let messages = match (p.conversation_id.as_deref(), p.friend_phone_number.as_deref()) {
            (Some(conversation_id), _) if !conversation_id.is_empty() => {
                self.services
                    .messages
                    .get_messages(conversation_id, &ctx.user_id, &query)
                    .await?
            }
            (_, Some(friend)) if !friend.trim().is_empty() => {
                self.services
                    .messages
                    .get_messages_with(&ctx.user_id, friend, &query)
                    .await?
                    .1
            }
            _ => {
                return Err(ChatError::validation(
                    "friendPhoneNumber or conversationId is required",
                ))
            }
        };
        let mut views = Vec::with_capacity(messages.len());
        for message in &messages {
            views.push(self.message_view(message).await);
        }
        conn.send_event(&ChatEvent::new("getChatMessagesSuccess", views));
        Ok(())
    }

    async fn anchor(&self, message_id: &str, ctx: &ConnectionContext) -> ChatResult<MessagePosition> {
        self.services
            .messages
            .position_of(message_id, &ctx.user_id)
            .await
    }

    async fn on_get_conversations(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: GetConversationsPayload,
    ) -> ChatResult<()> {
        let conversations = self
            .services
            .conversations
            .get_user_conversations(&ctx.user_id, p.limit, p.before)
            .await?;
        conn.send_event(&ChatEvent::new(
            "getConversationsSuccess",
            json!({"conversations": conversations}),
        ));
        Ok(())
    }

    async fn participants_of(&self, conversation_id: &str) -> Vec<String> {
        match self
            .services
            .conversations
            .get_participant_ids(conversation_id)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!("⚠️  participant lookup failed for {}: {}", conversation_id, e);
                Vec::new()
            }
        }
    }

    async fn on_edit_message(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: EditMessagePayload,
    ) -> ChatResult<()> {
        let edited = self
            .services
            .messages
            .edit_message(&p.message_id, &ctx.user_id, &p.new_text)
            .await?;
        let view = self.message_view(&edited).await;
        conn.send_event(&ChatEvent::new("editMessageSuccess", &view));
        let participants = self.participants_of(&edited.conversation_id).await;
        self.emit_to_users(&participants, &ChatEvent::new("messageEdited", &view))
            .await;
        Ok(())
    }

    async fn on_delete_message(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: MessageIdPayload,
    ) -> ChatResult<()> {
        let deleted = self
            .services
            .messages
            .soft_delete(&p.message_id, &ctx.user_id)
            .await?;
        conn.send_event(&ChatEvent::new(
            "deleteMessageSuccess",
            json!({"messageId": deleted.id}),
        ));
        let participants = self.participants_of(&deleted.conversation_id).await;
        self.emit_to_users(
            &participants,
            &ChatEvent::new(
                "messageDeleted",
                json!({"messageId": deleted.id, "conversationId": deleted.conversation_id}),
            ),
        )
        .await;
        Ok(())
    }

    async fn on_delete_for_me(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: MessageIdPayload,
    ) -> ChatResult<()> {
        let hidden = self
            .services
            .messages
            .delete_for_user(&p.message_id, &ctx.user_id)
            .await?;
        conn.send_event(&ChatEvent::new(
            "deleteMessageForMeSuccess",
            json!({"messageId": hidden.id, "conversationId": hidden.conversation_id}),
        ));
        Ok(())
    }

    async fn on_mark_read(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: CursorPayload,
    ) -> ChatResult<()> {
        let update = self
            .services
            .messages
            .mark_read(&p.conversation_id, &ctx.user_id, &p.message_id)
            .await?;
        conn.send_event(&ChatEvent::new(
            "markReadSuccess",
            json!({
                "conversationId": p.conversation_id,
                "messageId": update.state.last_read_message_id,
                "unreadCount": update.state.unread_count,
                "advanced": update.advanced,
            }),
        ));
        if update.advanced {
            let others: Vec<String> = self
                .participants_of(&p.conversation_id)
                .await
                .into_iter()
                .filter(|u| u != &ctx.user_id)
                .collect();
            self.emit_to_users(
                &others,
                &ChatEvent::new(
                    "messagesRead",
                    json!({
                        "conversationId": p.conversation_id,
                        "userId": ctx.user_id,
                        "messageId": p.message_id,
                    }),
                ),
            )
            .await;
        }
        Ok(())
    }

    async fn on_mark_delivered(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: CursorPayload,
    ) -> ChatResult<()> {
        let update = self
            .services
            .messages
            .mark_delivered(&p.conversation_id, &ctx.user_id, &p.message_id)
            .await?;
        conn.send_event(&ChatEvent::new(
            "markDeliveredSuccess",
            json!({
                "conversationId": p.conversation_id,
                "messageId": update.state.last_delivered_message_id,
                "advanced": update.advanced,
            }),
        ));
        if update.advanced {
            let others: Vec<String> = self
                .participants_of(&p.conversation_id)
                .await
                .into_iter()
                .filter(|u| u != &ctx.user_id)
                .collect();
            self.emit_to_users(
                &others,
                &ChatEvent::new(
                    "messagesDelivered",
                    json!({
                        "conversationId": p.conversation_id,
                        "userId": ctx.user_id,
                        "messageId": p.message_id,
                    }),
                ),
            )
            .await;
        }
        Ok(())
    }

    /// 输入状态不回执 / Typing is fire-and-forget, no acknowledgement
    async fn on_typing(
        &self,
        ctx: &ConnectionContext,
        p: ConversationPayload,
        started: bool,
    ) -> ChatResult<()> {
        let (name, others) = if started {
            (
                "typing",
                self.services
                    .typing
                    .set_typing(&p.conversation_id, &ctx.user_id)
                    .await?,
            )
        } else {
            (
                "stopTyping",
                self.services
                    .typing
                    .clear_typing(&p.conversation_id, &ctx.user_id)
                    .await?,
            )
        };
        self.emit_to_users(
            &others,
            &ChatEvent::new(
                name,
                json!({"conversationId": p.conversation_id, "userId": ctx.user_id}),
            ),
        )
        .await;
        Ok(())
    }

    fn mute_view(state: &ReadState) -> Value {
        json!({
            "conversationId": state.conversation_id,
            "isMuted": state.is_muted,
            "mutedUntil": state.muted_until,
        })
    }

    async fn on_mute(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: MutePayload,
    ) -> ChatResult<()> {
        let duration = p
            .duration_ms
            .map(|ms| chrono::Duration::milliseconds(ms.min(i64::MAX as u64) as i64));
        let state = self
            .services
            .messages
            .mute(&p.conversation_id, &ctx.user_id, duration)
            .await?;
        conn.send_event(&ChatEvent::new("muteConversationSuccess", Self::mute_view(&state)));
        Ok(())
    }

    async fn on_unmute(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: ConversationPayload,
    ) -> ChatResult<()> {
        let state = self
            .services
            .messages
            .unmute(&p.conversation_id, &ctx.user_id)
            .await?;
        conn.send_event(&ChatEvent::new("unmuteConversationSuccess", Self::mute_view(&state)));
        Ok(())
    }

    async fn on_get_total_unread(&self, conn: &Arc<Connection>, ctx: &ConnectionContext) -> ChatResult<()> {
        let total = self.services.messages.total_unread(&ctx.user_id).await?;
        conn.send_event(&ChatEvent::new("getTotalUnreadSuccess", json!({"totalUnread": total})));
        Ok(())
    }

    /* ---------------------------- 好友 / friends ---------------------------- */

    async fn on_search_users(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: SearchUsersPayload,
    ) -> ChatResult<()> {
        let results = self.services.users.search(&p.query, &ctx.user_id).await?;
        conn.send_event(&ChatEvent::new(
            "searchFriendResult",
            json!({"exists": !results.is_empty(), "results": results}),
        ));
        Ok(())
    }

    async fn on_get_friends(&self, conn: &Arc<Connection>, ctx: &ConnectionContext) -> ChatResult<()> {
        let friends = self.services.users.get_friends(&ctx.user_id).await?;
        conn.send_event(&ChatEvent::new("getFriendsSuccess", json!({"friends": friends})));
        Ok(())
    }

    async fn on_add_friend(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: AddFriendPayload,
    ) -> ChatResult<()> {
        let (me, friend) = self
            .services
            .users
            .add_friend(&ctx.user_id, &p.friend_phone)
            .await?;
        conn.send_event(&ChatEvent::new("addFriendSuccess", json!({"friend": friend})));
        let mirrored = FriendSummary {
            user: me.summary(),
            is_online: true,
        };
        self.emit_to_user(
            &friend.user.id,
            &ChatEvent::new("friendAdded", json!({"friend": mirrored})),
        )
        .await;
        Ok(())
    }

    async fn on_remove_friend(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: RemoveFriendPayload,
    ) -> ChatResult<()> {
        let me = self
            .services
            .users
            .remove_friend(&ctx.user_id, &p.friend_id)
            .await?;
        conn.send_event(&ChatEvent::new(
            "removeFriendSuccess",
            json!({"friendId": p.friend_id}),
        ));
        self.emit_to_user(
            &p.friend_id,
            &ChatEvent::new("friendRemoved", json!({"friendId": me.id})),
        )
        .await;
        Ok(())
    }

    /* ---------------------------- 群组 / groups ---------------------------- */

    async fn notify_conversation(&self, conversation: &Conversation, extra: Option<&str>, skip: &str) {
        let mut targets: Vec<String> = conversation
            .participant_ids
            .iter()
            .filter(|u| u.as_str() != skip)
            .cloned()
            .collect();
        if let Some(extra) = extra {
            if extra != skip && !conversation.is_participant(extra) {
                targets.push(extra.to_string());
            }
        }
        self.emit_to_users(
            &targets,
            &ChatEvent::new("conversationUpdated", json!({"conversation": conversation})),
        )
        .await;
    }

    async fn on_create_group(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: CreateGroupPayload,
    ) -> ChatResult<()> {
        let conversation = self
            .services
            .conversations
            .create_group(&ctx.user_id, &p.participant_ids, &p.title)
            .await?;
        conn.send_event(&ChatEvent::new(
            "createGroupSuccess",
            json!({"conversation": conversation}),
        ));
        self.notify_conversation(&conversation, None, &ctx.user_id).await;
        Ok(())
    }

    async fn on_add_participant(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: ParticipantPayload,
    ) -> ChatResult<()> {
        let conversation = self
            .services
            .conversations
            .add_participant(&p.conversation_id, &ctx.user_id, &p.user_id)
            .await?;
        conn.send_event(&ChatEvent::new(
            "addParticipantSuccess",
            json!({"conversation": conversation}),
        ));
        self.notify_conversation(&conversation, None, &ctx.user_id).await;
        Ok(())
    }

    async fn on_remove_participant(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: ParticipantPayload,
    ) -> ChatResult<()> {
        let conversation = self
            .services
            .conversations
            .remove_participant(&p.conversation_id, &ctx.user_id, &p.user_id)
            .await?;
        conn.send_event(&ChatEvent::new(
            "removeParticipantSuccess",
            json!({"conversation": conversation}),
        ));
        self.notify_conversation(&conversation, Some(&p.user_id), &ctx.user_id)
            .await;
        Ok(())
    }

    async fn on_leave_group(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: ConversationPayload,
    ) -> ChatResult<()> {
        let conversation = self
            .services
            .conversations
            .leave_group(&p.conversation_id, &ctx.user_id)
            .await?;
        conn.send_event(&ChatEvent::new(
            "leaveGroupSuccess",
            json!({"conversationId": conversation.id}),
        ));
        self.notify_conversation(&conversation, None, &ctx.user_id).await;
        Ok(())
    }

    async fn on_get_presence(&self, conn: &Arc<Connection>, p: GetPresencePayload) -> ChatResult<()> {
        if p.user_ids.len() > MAX_PRESENCE_BATCH {
            return Err(ChatError::validation(format!(
                "At most {} user ids per request",
                MAX_PRESENCE_BATCH
            )));
        }
        let presence = self.services.presence.get_presence_batch(&p.user_ids).await;
        conn.send_event(&ChatEvent::new("getPresenceSuccess", json!({"presence": presence})));
        Ok(())
    }

    /* ---------------------------- 通话 / calls ---------------------------- */

    async fn on_call(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: CallPayload,
    ) -> ChatResult<()> {
        let session = self.services.calls.initiate(&ctx.user_id, &p.receiver).await?;
        let receiver = session.receiver.summary();
        self.emit_to_user(
            &session.receiver.id,
            &ChatEvent::new(
                "incomingCall",
                json!({
                    "callId": session.call_id,
                    "caller": {
                        "userId": ctx.user_id,
                        "phoneNumber": ctx.phone_number,
                        "socketId": conn.id,
                    },
                    "receiver": receiver,
                }),
            ),
        )
        .await;
        conn.send_event(&ChatEvent::new(
            "callInitiated",
            json!({"callId": session.call_id, "receiver": receiver}),
        ));
        info!("📞 Call {} initiated by {}", session.call_id, ctx.user_id);
        Ok(())
    }

    async fn on_answer(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: CallReplyPayload,
    ) -> ChatResult<()> {
        let caller = self
            .services
            .calls
            .answer(&ctx.user_id, &p.caller, &p.call_id)
            .await?;
        self.emit_to_user(
            &caller.id,
            &ChatEvent::new(
                "callAccepted",
                json!({
                    "callId": p.call_id,
                    "caller": caller.summary(),
                    "answerer": {
                        "userId": ctx.user_id,
                        "phoneNumber": ctx.phone_number,
                        "socketId": conn.id,
                    },
                }),
            ),
        )
        .await;
        conn.send_event(&ChatEvent::new(
            "callConnected",
            json!({"callId": p.call_id, "caller": caller.summary()}),
        ));
        Ok(())
    }

    async fn on_reject(
        &self,
        _conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: CallReplyPayload,
    ) -> ChatResult<()> {
        let caller = self
            .services
            .calls
            .reject(&ctx.user_id, &p.caller, &p.call_id)
            .await?;
        self.emit_to_user(
            &caller.id,
            &ChatEvent::new(
                "callRejected",
                json!({
                    "callId": p.call_id,
                    "caller": caller.summary(),
                    "rejecter": {"userId": ctx.user_id, "phoneNumber": ctx.phone_number},
                }),
            ),
        )
        .await;
        Ok(())
    }

    async fn on_hang_up(
        &self,
        conn: &Arc<Connection>,
        ctx: &ConnectionContext,
        p: HangUpPayload,
    ) -> ChatResult<()> {
        let (caller, receiver) = self
            .services
            .calls
            .hang_up(&ctx.user_id, &p.call_id, &p.caller, &p.receiver)
            .await?;
        let other = if caller.id == ctx.user_id { &receiver } else { &caller };
        self.emit_to_user(
            &other.id,
            &ChatEvent::new(
                "callEnded",
                json!({"callId": p.call_id, "endedBy": ctx.user_id}),
            ),
        )
        .await;
        conn.send_event(&ChatEvent::new("callEnded", json!({"callId": p.call_id})));
        info!("📴 Call {} ended by {}", p.call_id, ctx.user_id);
        Ok(())
    }

    /// WebRTC 信令原样转发 / Relay signalling verbatim, tagged with `from`
    async fn on_signal(&self, conn: &Arc<Connection>, name: &str, p: SignalPayload) -> ChatResult<()> {
        if p.target_socket_id.trim().is_empty() {
            return Err(ChatError::validation("targetSocketId is required"));
        }
        let mut body = p.body;
        body.insert("from".to_string(), json!(conn.id));
        self.emit_to_connection(&p.target_socket_id, &ChatEvent::new(name, Value::Object(body)))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{drain, gateway};

    fn frame(event: &str, data: Value) -> String {
        ChatEvent::new(event, data).to_text()
    }

    fn find<'a>(events: &'a [ChatEvent], name: &str) -> Option<&'a ChatEvent> {
        events.iter().find(|e| e.event == name)
    }

    #[test]
    fn test_error_event_names() {
        assert_eq!(error_event_name("register"), "registrationError");
        assert_eq!(error_event_name("hangUp"), "callError");
        assert_eq!(error_event_name("chatMessage"), "chatMessageError");
        assert_eq!(notification_preview(""), "Media message");
        assert_eq!(notification_preview(&"x".repeat(80)).len(), 50);
    }

    #[tokio::test]
    async fn test_anonymous_messaging_is_rejected() {
        let (gw, _coord, _tmp) = gateway("n");
        let (conn, mut rx) = gw.attach_connection(None);
        gw.handle_text(&conn, &frame("chatMessage", json!({"receiver": "2", "message": "hi"})))
            .await;
        let events = drain(&mut rx);
        let err = find(&events, "chatMessageError").expect("error event");
        assert_eq!(err.data["code"], "NOT_AUTHENTICATED");
        assert_eq!(err.data["message"], "Not authenticated");
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_event() {
        let (gw, _coord, _tmp) = gateway("n");
        let (conn, mut rx) = gw.attach_connection(None);
        gw.handle_text(&conn, "not json").await;
        let events = drain(&mut rx);
        assert_eq!(find(&events, "error").unwrap().data["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_sign_in_twice_is_rejected() {
        let (gw, _coord, _tmp) = gateway("n");
        let (conn, mut rx) = gw.attach_connection(None);
        let creds = json!({"phoneNumber": "100", "username": "ann", "passcode": "pw"});
        gw.handle_text(&conn, &frame("register", creds.clone())).await;
        gw.handle_text(&conn, &frame("signIn", creds.clone())).await;
        gw.handle_text(&conn, &frame("signIn", creds)).await;
        let events = drain(&mut rx);
        assert!(find(&events, "registrationSuccess").is_some());
        assert!(find(&events, "signInSuccess").unwrap().data["token"].is_string());
        assert_eq!(
            find(&events, "signInError").unwrap().data["message"],
            "Already authenticated"
        );
        assert!(gw.services.presence.is_online(conn.user_id().unwrap()).await);
    }

    #[tokio::test]
    async fn test_register_errors_use_registration_error() {
        let (gw, _coord, _tmp) = gateway("n");
        let (conn, mut rx) = gw.attach_connection(None);
        gw.handle_text(&conn, &frame("register", json!({"phoneNumber": "1"}))).await;
        let events = drain(&mut rx);
        assert_eq!(
            find(&events, "registrationError").unwrap().data["message"],
            "All fields are required"
        );
    }
}
