use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use v::response::respond_any;

use crate::gateway::ChatGateway;

pub const ROUTE_PATH: &str = "/health/ready";

// 路由注册入口（GET）
// Route registration entry (GET)
pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(health_ready_handle)));
}

// 就绪检查：持久化与协调存储均可达
// Readiness: both the durable and coordination stores answer
pub async fn health_ready_handle(gateway: web::Data<ChatGateway>) -> impl Responder {
    let components = super::collect(&gateway).await;
    let is_ready = components.iter().all(|c| c.healthy);
    let payload = serde_json::json!({
        "ready": is_ready,
        "service": "v-connect-chat",
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "components": components,
    });
    let code = if is_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    respond_any(code, payload)
}
