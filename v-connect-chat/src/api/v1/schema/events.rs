use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use v::response::respond_any;

use crate::domain::event::{
    ChatEvent, ChatMessagePayload, CursorPayload, ErrorPayload, GetChatMessagesPayload,
    MutePayload, SearchUsersPayload, SignInPayload,
};

pub const ROUTE_PATH: &str = "/schema/events";

// 路由注册入口（GET）/ Register route (GET)
pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(schema_events_handle)));
}

// 事件信封与主要负载的 JSON Schema / JSON schema of the envelope and core payloads
pub async fn schema_events_handle() -> impl Responder {
    respond_any(
        StatusCode::OK,
        serde_json::json!({
            "envelope": schemars::schema_for!(ChatEvent),
            "payloads": {
                "signIn": schemars::schema_for!(SignInPayload),
                "chatMessage": schemars::schema_for!(ChatMessagePayload),
                "getChatMessages": schemars::schema_for!(GetChatMessagesPayload),
                "markRead": schemars::schema_for!(CursorPayload),
                "muteConversation": schemars::schema_for!(MutePayload),
                "searchUsers": schemars::schema_for!(SearchUsersPayload),
                "error": schemars::schema_for!(ErrorPayload),
            },
        }),
    )
}
