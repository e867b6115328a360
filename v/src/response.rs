use actix_web::{
    http::{header, StatusCode},
    HttpResponse,
};

// 通用 HTTP 响应封装（支持 JSON、文本、二进制）
// Generic HTTP response helpers (supports JSON, text, binary)

pub enum AutoBody {
    Json(serde_json::Value),
    Text(String),
    Bytes { content_type: String, data: Vec<u8> },
}

impl From<serde_json::Value> for AutoBody {
    fn from(v: serde_json::Value) -> Self {
        AutoBody::Json(v)
    }
}

impl From<String> for AutoBody {
    fn from(s: String) -> Self {
        AutoBody::Text(s)
    }
}

impl From<Vec<u8>> for AutoBody {
    fn from(b: Vec<u8>) -> Self {
        AutoBody::Bytes {
            content_type: "application/octet-stream".to_string(),
            data: b,
        }
    }
}

// 通用响应（结构体自动转 JSON，失败则原样文本）
// Generic response: auto JSON from struct, fallback to text
pub fn respond_any<T: serde::Serialize + std::fmt::Debug>(
    code: StatusCode,
    data: T,
) -> HttpResponse {
    match serde_json::to_value(&data) {
        Ok(v) => HttpResponse::build(code).json(v),
        Err(_) => HttpResponse::build(code)
            .content_type("text/plain; charset=utf-8")
            .body(format!("{:?}", data)),
    }
}

// 指定体裁响应（JSON/Text/Binary）
// Response with explicit body kind (JSON/Text/Binary)
pub fn respond_body<B: Into<AutoBody>>(code: StatusCode, body: B) -> HttpResponse {
    match body.into() {
        AutoBody::Json(v) => HttpResponse::build(code).json(v),
        AutoBody::Text(s) => HttpResponse::build(code)
            .content_type("text/plain; charset=utf-8")
            .body(s),
        AutoBody::Bytes { content_type, data } => HttpResponse::build(code)
            .insert_header((header::CONTENT_TYPE, content_type))
            .body(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respond_any_serializes_json() {
        let resp = respond_any(StatusCode::CREATED, serde_json::json!({"ok": true}));
        assert_eq!(resp.status(), StatusCode::CREATED);
        let ct = resp.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(ct.to_str().unwrap().starts_with("application/json"));
    }

    #[test]
    fn test_respond_body_bytes_keeps_content_type() {
        let resp = respond_body(
            StatusCode::OK,
            AutoBody::Bytes {
                content_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            },
        );
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );
    }
}
