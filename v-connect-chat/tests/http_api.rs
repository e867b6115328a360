//! HTTP 接口测试 / HTTP API tests

mod common;

use actix_web::http::{header, StatusCode};
use actix_web::{test, web, App};
use serde_json::{json, Value};

use common::{find, Client, Shared};
use v_connect_chat::cluster::signing::sign_body;
use v_connect_chat::cluster::CLUSTER_SIGNATURE_HEADER;
use v_connect_chat::domain::event::ChatEvent;
use v_connect_chat::gateway::ChatGateway;

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 1, 2, 3, 4];

async fn token_for(gateway: &ChatGateway, phone: &str, username: &str) -> String {
    gateway
        .services
        .users
        .register(phone, username, "secret", None)
        .await
        .unwrap();
    let (_, result) = gateway
        .services
        .users
        .sign_in(phone, username, "secret")
        .await
        .unwrap();
    result.token
}

/// 以集群密钥签名的内部请求 / Internal request signed with the cluster secret
fn signed_post(uri: &str, body: Value, secret: &str) -> test::TestRequest {
    let payload = serde_json::to_vec(&body).unwrap();
    let signature = sign_body(&payload, secret).unwrap();
    test::TestRequest::post()
        .uri(uri)
        .insert_header((header::CONTENT_TYPE, "application/json"))
        .insert_header((CLUSTER_SIGNATURE_HEADER, signature))
        .set_payload(payload)
}

macro_rules! app {
    ($gateway:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($gateway.clone()))
                .configure(v_connect_chat::router::configure),
        )
        .await
    };
}

#[actix_web::test]
async fn test_health_endpoints() {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let app = app!(gw);

    let req = test::TestRequest::get().uri("/v1/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["nodeId"], "node-a");

    for uri in ["/v1/health/live", "/v1/health/ready"] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK, "{}", uri);
    }
}

#[actix_web::test]
async fn test_upload_requires_bearer_token() {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let app = app!(gw);

    let req = test::TestRequest::post()
        .uri("/v1/media/upload?receiver=200")
        .insert_header((header::CONTENT_TYPE, "image/png"))
        .set_payload(PNG)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::post()
        .uri("/v1/media/upload?receiver=200")
        .insert_header((header::CONTENT_TYPE, "image/png"))
        .insert_header((header::AUTHORIZATION, "Bearer not-a-token"))
        .set_payload(PNG)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn test_upload_rejects_unsupported_type() {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let token = token_for(&gw, "100", "alice").await;
    let app = app!(gw);

    let req = test::TestRequest::post()
        .uri("/v1/media/upload?receiver=200")
        .insert_header((header::CONTENT_TYPE, "text/plain"))
        .insert_header((header::AUTHORIZATION, format!("Bearer {}", token)))
        .set_payload("hello")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[actix_web::test]
async fn test_upload_rejects_oversized_body() {
    let shared = Shared::new();
    let mut cfg = shared.config("node-a");
    cfg.media.max_file_bytes = 8;
    let gw = shared.node_with(cfg);
    let token = token_for(&gw, "100", "alice").await;
    let app = app!(gw);

    let req = test::TestRequest::post()
        .uri("/v1/media/upload?receiver=200")
        .insert_header((header::CONTENT_TYPE, "image/png"))
        .insert_header((header::AUTHORIZATION, format!("Bearer {}", token)))
        .set_payload(PNG)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

/// 上传即发送图片消息，重复上传幂等 / Upload sends an image message; retries are idempotent
#[actix_web::test]
async fn test_upload_sends_image_message_and_serves_media() {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let token = token_for(&gw, "100", "alice").await;
    token_for(&gw, "200", "bob").await;
    let mut bob = Client::open(&gw);
    bob.send(
        &gw,
        "signIn",
        json!({"phoneNumber": "200", "username": "bob", "passcode": "secret"}),
    )
    .await;
    bob.drain();
    let app = app!(gw);

    let upload = || {
        test::TestRequest::post()
            .uri("/v1/media/upload?receiver=200&clientMessageId=u1&text=look")
            .insert_header((header::CONTENT_TYPE, "image/png"))
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", token)))
            .set_payload(PNG)
            .to_request()
    };

    let resp = test::call_service(&app, upload()).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let first: Value = test::read_body_json(resp).await;
    assert_eq!(first["type"], "image");
    assert_eq!(first["text"], "look");
    assert_eq!(first["media"]["mimeType"], "image/png");
    let pushed = bob.drain();
    assert_eq!(find(&pushed, "newMessage").expect("pushed").data["id"], first["id"]);

    let resp = test::call_service(&app, upload()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let second: Value = test::read_body_json(resp).await;
    assert_eq!(second["id"], first["id"]);
    assert_eq!(second["isDuplicate"], true);
    assert!(find(&bob.drain(), "newMessage").is_none());

    let media_id = first["mediaRef"].as_str().unwrap();
    let req = test::TestRequest::get()
        .uri(&format!("/media/{}", media_id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/png"
    );
    let bytes = test::read_body(resp).await;
    assert_eq!(bytes.as_ref(), PNG);

    let req = test::TestRequest::get().uri("/media/missing").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_internal_forward_and_broadcast() {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut anon = Client::open(&gw);
    anon.drain();
    let app = app!(gw);

    let secret = gw.config.cluster_secret.clone();

    let text = ChatEvent::new("ping", json!({})).to_text();
    let req = signed_post(
        "/v1/internal/forward",
        json!({"connectionId": anon.conn.id, "text": text}),
        &secret,
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(find(&anon.drain(), "ping").is_some());

    let req = signed_post(
        "/v1/internal/forward",
        json!({"connectionId": "node-a:gone", "text": text}),
        &secret,
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // 广播只投递给已鉴权连接 / Broadcast reaches authenticated connections only
    let req = signed_post("/v1/internal/broadcast", json!({"text": text}), &secret).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["delivered"], 0);
    assert!(anon.drain().is_empty());
}

#[actix_web::test]
async fn test_internal_endpoints_reject_unsigned_requests() {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut anon = Client::open(&gw);
    anon.drain();
    let app = app!(gw);
    let text = ChatEvent::new("ping", json!({})).to_text();
    let forward = json!({"connectionId": anon.conn.id, "text": text});

    let req = test::TestRequest::post()
        .uri("/v1/internal/forward")
        .set_json(forward.clone())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = signed_post("/v1/internal/forward", forward, "wrong-secret").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::post()
        .uri("/v1/internal/broadcast")
        .set_json(json!({"text": text}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(anon.drain().is_empty());

    // 签名正确但请求体不合法 / valid signature, malformed body
    let req = signed_post(
        "/v1/internal/broadcast",
        json!({"message": "x"}),
        &gw.config.cluster_secret,
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_event_schema_endpoint() {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let app = app!(gw);
    let req = test::TestRequest::get().uri("/v1/schema/events").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert!(body.is_object());
}
