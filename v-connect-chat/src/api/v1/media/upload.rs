use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::info;
use v::http::HttpError;
use v::response::respond_any;

use crate::domain::{MessageType, NewMessage};
use crate::error::ChatError;
use crate::gateway::{ChatGateway, ConnectionContext};
use crate::service::MediaKind;

pub const ROUTE_PATH: &str = "/media/upload";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    pub receiver: Option<String>,
    pub conversation_id: Option<String>,
    pub client_message_id: Option<String>,
    pub text: Option<String>,
    pub filename: Option<String>,
}

// 路由注册入口（POST）/ Register route (POST)
pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::post().to(media_upload_handle)));
}

fn content_type(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(actix_web::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
}

// 图片消息上传：与实时通道共用同一发送路径
// Image message upload, sharing the socket send path
pub async fn media_upload_handle(
    gateway: web::Data<ChatGateway>,
    req: HttpRequest,
    query: web::Query<UploadQuery>,
    mut payload: web::Payload,
) -> Result<HttpResponse, HttpError> {
    let user = super::bearer_user(&gateway, &req).await?;
    let media_cfg = &gateway.config.media;

    let mime_type = content_type(&req)
        .filter(|m| media_cfg.allowed_mime_types.iter().any(|a| a == m))
        .ok_or_else(|| {
            HttpError::UnsupportedMediaType(format!(
                "Allowed types: {}",
                media_cfg.allowed_mime_types.join(", ")
            ))
        })?;

    let mut bytes = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| HttpError::BadRequest(e.to_string()))?;
        if bytes.len() + chunk.len() > media_cfg.max_file_bytes {
            return Err(HttpError::PayloadTooLarge(format!(
                "File exceeds {} bytes",
                media_cfg.max_file_bytes
            )));
        }
        bytes.extend_from_slice(&chunk);
    }

    if !gateway
        .services
        .rate_limiter
        .check_event_limit(&user.id, "message")
        .await
    {
        return Err(ChatError::RateLimited.into());
    }

    let media = gateway
        .services
        .media
        .save(
            &bytes,
            &mime_type,
            query.filename.as_deref(),
            &user.id,
            MediaKind::Message,
        )
        .await?;
    let draft = NewMessage {
        conversation_id: String::new(),
        sender_id: user.id.clone(),
        message_type: MessageType::Image,
        text: query.text.clone().unwrap_or_default(),
        media_ref: Some(media.id.clone()),
        reply_to: None,
        client_message_id: query.client_message_id.clone(),
    };
    let ctx = ConnectionContext::for_user(&user);
    let (outcome, _, view) = gateway
        .send_chat_message(
            &ctx,
            query.receiver.as_deref(),
            query.conversation_id.as_deref(),
            draft,
        )
        .await?;
    info!(
        "🖼️  Media message {} uploaded by {} ({} bytes)",
        outcome.message.id,
        user.id,
        bytes.len()
    );
    let code = if outcome.is_duplicate { StatusCode::OK } else { StatusCode::CREATED };
    Ok(respond_any(code, view))
}
