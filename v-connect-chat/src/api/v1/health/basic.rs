use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use v::response::respond_any;

use crate::gateway::ChatGateway;

pub const ROUTE_PATH: &str = "/health";

// 路由注册入口（GET）
// Route registration entry (GET)
pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(health_basic_handle)));
}

// 基础健康检查
// Basic health check
pub async fn health_basic_handle(gateway: web::Data<ChatGateway>) -> impl Responder {
    let components = super::collect(&gateway).await;
    let healthy = components.iter().all(|c| c.healthy);
    respond_any(
        StatusCode::OK,
        serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "v-connect-chat",
            "nodeId": gateway.node_id,
            "connections": gateway.connection_count(),
            "components": components,
        }),
    )
}
