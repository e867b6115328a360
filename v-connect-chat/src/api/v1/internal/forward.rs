use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use v::http::HttpError;
use v::response::respond_any;

use super::signed_json;
use crate::gateway::ChatGateway;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    pub connection_id: String,
    pub text: String,
}

// 路由注册入口（POST）/ Register route (POST)
pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::post().to(forward_handle)));
}

// 向本节点连接转发文本帧 / Forward a text frame to a local connection
pub async fn forward_handle(
    gateway: web::Data<ChatGateway>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, HttpError> {
    let forward: ForwardRequest = signed_json(&gateway, &req, &body)?;
    if gateway.deliver_local(&forward.connection_id, forward.text) {
        Ok(respond_any(StatusCode::OK, serde_json::json!({ "ok": true })))
    } else {
        Err(HttpError::NotFound(format!(
            "Connection {} not found",
            forward.connection_id
        )))
    }
}
