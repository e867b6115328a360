use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::WebhookConfig;

pub const SIGNATURE_HEADER: &str = "X-VConnectChat-Signature";

/// 对外发布的事件 / Outbound analytics/notification event
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEvent {
    pub event_type: String,
    pub event_id: String,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl OutboundEvent {
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }
}

/// 尽力而为的事件发布 / Best-effort event publishing
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboundEvent) -> Result<()>;
}

/// 未启用 webhook 时使用 / Used when the webhook is disabled
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        debug!("publish skipped: {}", event.event_type);
        Ok(())
    }
}

pub struct WebhookPublisher {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookPublisher {
    pub fn new(url: &str, secret: Option<String>, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            url: url.to_string(),
            secret,
        })
    }
}

/// HMAC-SHA256 签名 `sha256=<hex>` / Body signature
pub fn sign_body(body: &[u8], secret: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("invalid webhook secret: {}", e))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        let body = serde_json::to_vec(event)?;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_body(&body, secret)?);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("Webhook request failed: {}", e))?;
        if response.status().is_success() {
            debug!("webhook event {} delivered", event.event_id);
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow!("Webhook delivery failed with status {}: {}", status, text))
        }
    }
}

/// 按配置选择发布器 / Pick the publisher for the configuration
pub fn from_config(cfg: &WebhookConfig) -> Arc<dyn EventPublisher> {
    match (&cfg.url, cfg.enabled) {
        (Some(url), true) => match WebhookPublisher::new(url, cfg.secret.clone(), cfg.timeout_ms) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                warn!("webhook disabled: {}", e);
                Arc::new(NoopPublisher)
            }
        },
        _ => Arc::new(NoopPublisher),
    }
}

/// 在独立任务中发布，失败只记日志 / Publish on a detached task; failures are only logged
pub fn publish_detached(publisher: Arc<dyn EventPublisher>, event: OutboundEvent) {
    tokio::spawn(async move {
        if let Err(e) = publisher.publish(&event).await {
            warn!("best-effort publish of {} failed: {}", event.event_type, e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Failing(Mutex<u32>);

    #[async_trait]
    impl EventPublisher for Failing {
        async fn publish(&self, _event: &OutboundEvent) -> Result<()> {
            *self.0.lock() += 1;
            Err(anyhow!("sink down"))
        }
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let a = sign_body(b"{}", "secret").unwrap();
        let b = sign_body(b"{}", "secret").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
        assert_eq!(a.len(), "sha256=".len() + 64);
        assert_ne!(a, sign_body(b"{}", "other").unwrap());
    }

    #[tokio::test]
    async fn test_detached_failure_is_swallowed() {
        let sink = Arc::new(Failing(Mutex::new(0)));
        publish_detached(
            sink.clone(),
            OutboundEvent::new("message.created", serde_json::json!({"id": "m1"})),
        );
        for _ in 0..50 {
            if *sink.0.lock() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*sink.0.lock(), 1);
    }

    #[test]
    fn test_disabled_config_uses_noop() {
        let cfg = WebhookConfig {
            enabled: false,
            url: Some("http://127.0.0.1:1".into()),
            secret: None,
            timeout_ms: 100,
        };
        // 不会发起网络请求 / never touches the network
        let p = from_config(&cfg);
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async { p.publish(&OutboundEvent::new("x", serde_json::json!({}))).await })
            .unwrap();
    }
}
