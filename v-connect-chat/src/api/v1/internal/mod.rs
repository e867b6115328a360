//! 跨节点内部接口 / Cross-node internal endpoints
//!
//! 请求体须带集群共享密钥的 HMAC 签名 / Bodies must carry an HMAC signature under the cluster secret

pub mod broadcast;
pub mod forward;

use actix_web::{web, HttpRequest};
use serde::de::DeserializeOwned;
use tracing::warn;
use v::http::HttpError;

use crate::cluster::{verify_body, CLUSTER_SIGNATURE_HEADER};
use crate::gateway::ChatGateway;

/// 校验签名后解析 JSON 请求体 / Verify the signature, then decode the JSON body
pub fn signed_json<T: DeserializeOwned>(
    gateway: &ChatGateway,
    req: &HttpRequest,
    body: &web::Bytes,
) -> Result<T, HttpError> {
    let signature = req
        .headers()
        .get(CLUSTER_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HttpError::Unauthorized("Missing cluster signature".to_string()))?;
    if !verify_body(body, &gateway.config.cluster_secret, signature) {
        warn!("⚠️  Rejected internal request to {} with a bad signature", req.path());
        return Err(HttpError::Unauthorized("Invalid cluster signature".to_string()));
    }
    serde_json::from_slice(body)
        .map_err(|e| HttpError::BadRequest(format!("Invalid request body: {}", e)))
}
