pub mod serve;
pub mod upload;

use actix_web::HttpRequest;
use v::http::HttpError;

use crate::domain::User;
use crate::gateway::ChatGateway;

/// 从 `Authorization: Bearer` 解析用户 / Resolve the caller from a bearer token
pub async fn bearer_user(gateway: &ChatGateway, req: &HttpRequest) -> Result<User, HttpError> {
    let token = req
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HttpError::Unauthorized("Missing bearer token".to_string()))?;
    Ok(gateway.services.users.authenticate_token(token).await?)
}
