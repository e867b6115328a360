use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GitHubFieldError {
    pub resource: String,
    pub field: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl GitHubFieldError {
    pub fn new(resource: &str, field: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            resource: resource.to_string(),
            field: field.to_string(),
            code: code.to_string(),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GitHubErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GitHubFieldError>>,
}

/// HTTP 错误（GitHub 风格响应体）/ HTTP error rendered as a GitHub-style body
#[derive(Debug, Clone)]
pub enum HttpError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    PayloadTooLarge(String),
    UnsupportedMediaType(String),
    Validation(Vec<GitHubFieldError>),
    Conflict(String),
    TooManyRequests(String),
    Internal(String),
}

impl HttpError {
    pub fn status_code(&self) -> u16 {
        match self {
            HttpError::BadRequest(_) => 400,
            HttpError::Unauthorized(_) => 401,
            HttpError::Forbidden(_) => 403,
            HttpError::NotFound(_) => 404,
            HttpError::Conflict(_) => 409,
            HttpError::PayloadTooLarge(_) => 413,
            HttpError::UnsupportedMediaType(_) => 415,
            HttpError::Validation(_) => 422,
            HttpError::TooManyRequests(_) => 429,
            HttpError::Internal(_) => 500,
        }
    }

    pub fn to_body(&self, documentation_url: Option<String>) -> GitHubErrorBody {
        match self {
            HttpError::Validation(errors) => GitHubErrorBody {
                message: "Validation Failed".to_string(),
                documentation_url,
                errors: Some(errors.clone()),
            },
            HttpError::BadRequest(msg)
            | HttpError::Unauthorized(msg)
            | HttpError::Forbidden(msg)
            | HttpError::NotFound(msg)
            | HttpError::PayloadTooLarge(msg)
            | HttpError::UnsupportedMediaType(msg)
            | HttpError::Conflict(msg)
            | HttpError::TooManyRequests(msg)
            | HttpError::Internal(msg) => GitHubErrorBody {
                message: msg.clone(),
                documentation_url,
                errors: None,
            },
        }
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            HttpError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            HttpError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            HttpError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            HttpError::PayloadTooLarge(msg) => write!(f, "Payload Too Large: {}", msg),
            HttpError::UnsupportedMediaType(msg) => write!(f, "Unsupported Media Type: {}", msg),
            HttpError::Validation(_) => write!(f, "Validation Failed"),
            HttpError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            HttpError::TooManyRequests(msg) => write!(f, "Too Many Requests: {}", msg),
            HttpError::Internal(msg) => write!(f, "Internal Error: {}", msg),
        }
    }
}

#[cfg(feature = "web_actix")]
impl actix_web::ResponseError for HttpError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(HttpError::status_code(self))
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(actix_web::ResponseError::status_code(self))
            .json(self.to_body(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_body_serialization() {
        let errs = vec![GitHubFieldError::new(
            "Message",
            "receiver",
            "missing_field",
            "receiver is required",
        )];
        let e = HttpError::Validation(errs);
        let body = e.to_body(Some("https://docs.example".to_string()));
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("Validation Failed"));
        assert!(json.contains("documentation_url"));
        assert!(json.contains("receiver"));
        assert_eq!(e.status_code(), 422);
        assert_eq!(body.errors.unwrap().len(), 1);
    }

    #[test]
    fn test_status_codes_for_upload_errors() {
        assert_eq!(HttpError::PayloadTooLarge("x".into()).status_code(), 413);
        assert_eq!(HttpError::UnsupportedMediaType("x".into()).status_code(), 415);
        assert_eq!(HttpError::Unauthorized("x".into()).to_body(None).message, "x");
    }
}
