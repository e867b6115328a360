use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use v::http::HttpError;
use v::response::{respond_body, AutoBody};

use crate::gateway::ChatGateway;

pub const ROUTE_PATH: &str = "/media/{id}";

// 路由注册入口（GET）/ Register route (GET)
pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(media_serve_handle)));
}

// 读取已存媒体 / Serve stored media bytes
pub async fn media_serve_handle(
    gateway: web::Data<ChatGateway>,
    id: web::Path<String>,
) -> Result<HttpResponse, HttpError> {
    match gateway.services.media.read(&id).await? {
        Some((meta, data)) => Ok(respond_body(
            StatusCode::OK,
            AutoBody::Bytes {
                content_type: meta.mime_type,
                data,
            },
        )),
        None => Err(HttpError::NotFound("Media not found".to_string())),
    }
}
