use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use v::http::HttpError;
use v::response::respond_any;

use super::signed_json;
use crate::gateway::ChatGateway;

#[derive(Debug, serde::Deserialize)]
pub struct BroadcastRequest {
    pub text: String,
}

// 路由注册入口（POST）/ Register route (POST)
pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::post().to(broadcast_handle)));
}

// 仅广播到本节点 / Broadcast to this node only
pub async fn broadcast_handle(
    gateway: web::Data<ChatGateway>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, HttpError> {
    let broadcast: BroadcastRequest = signed_json(&gateway, &req, &body)?;
    let delivered = gateway.broadcast_local(&broadcast.text);
    Ok(respond_any(StatusCode::OK, serde_json::json!({ "delivered": delivered })))
}
