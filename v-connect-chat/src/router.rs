use actix_web::web;

/// 路由配置包装 / Route configuration wrapper
pub fn configure(cfg: &mut web::ServiceConfig) {
    crate::api::v1::health::basic::register(cfg, "/v1/health");
    crate::api::v1::health::live::register(cfg, "/v1/health/live");
    crate::api::v1::health::ready::register(cfg, "/v1/health/ready");
    crate::api::v1::media::upload::register(cfg, "/v1/media/upload");
    crate::api::v1::media::serve::register(cfg, "/media/{id}");
    crate::api::v1::schema::events::register(cfg, "/v1/schema/events");
    // 内部跨节点API / internal cross-node APIs
    crate::api::v1::internal::forward::register(cfg, "/v1/internal/forward");
    crate::api::v1::internal::broadcast::register(cfg, "/v1/internal/broadcast");
}
