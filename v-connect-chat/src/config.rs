use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use v::ConfigManager;

/// 服务监听配置 / Listener configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub node_id: String,
    pub auth_deadline_ms: u64,
}

/// 在线状态配置 / Presence configuration
#[derive(Clone, Debug)]
pub struct PresenceConfig {
    pub ttl: Duration,
    pub heartbeat_interval: Duration,
    pub offline_ttl_multiplier: u32,
}

/// 单个事件类型的限流策略 / Per-event rate limit policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max: i64,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(max: i64, window_ms: u64) -> Self {
        Self {
            max,
            window: Duration::from_millis(window_ms),
        }
    }
}

/// 限流策略表 / Policy table keyed by event type
#[derive(Clone, Debug)]
pub struct RateLimitPolicies {
    pub policies: HashMap<String, RateLimitPolicy>,
    pub default: RateLimitPolicy,
}

impl RateLimitPolicies {
    pub fn policy_for(&self, event_type: &str) -> RateLimitPolicy {
        self.policies
            .get(event_type)
            .copied()
            .unwrap_or(self.default)
    }

    pub fn with_policy(mut self, event_type: &str, policy: RateLimitPolicy) -> Self {
        self.policies.insert(event_type.to_string(), policy);
        self
    }
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert("message".to_string(), RateLimitPolicy::new(10, 1000));
        policies.insert("typing".to_string(), RateLimitPolicy::new(2, 1000));
        policies.insert("search".to_string(), RateLimitPolicy::new(5, 5000));
        Self {
            policies,
            default: RateLimitPolicy::new(10, 1000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl: Duration,
    /// 连续失败达到该次数后锁定 / Failed sign-ins before the phone number is locked
    pub max_sign_in_failures: i64,
    pub lockout: Duration,
    /// Argon2id 成本参数 / Argon2id cost parameters
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinationBackend {
    Memory,
    Redis { url: String },
}

#[derive(Clone, Debug)]
pub struct MediaConfig {
    pub dir: String,
    pub max_file_bytes: usize,
    pub allowed_mime_types: Vec<String>,
    pub public_base_url: String,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub secret: Option<String>,
    pub timeout_ms: u64,
}

/// 集群对等节点 / Cluster peer
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub node_id: String,
    pub url: String,
}

/// 服务完整配置 / Full server configuration
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub server: ServerConfig,
    pub presence: PresenceConfig,
    pub typing_ttl: Duration,
    pub rate_limits: RateLimitPolicies,
    pub auth: AuthConfig,
    pub storage: StorageBackend,
    pub coordination: CoordinationBackend,
    pub media: MediaConfig,
    pub webhook: WebhookConfig,
    pub peers: Vec<PeerConfig>,
    /// 节点间内部接口的共享签名密钥 / Shared secret signing node-to-node requests
    pub cluster_secret: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                ws_port: 5200,
                http_port: 8080,
                node_id: "node-local".to_string(),
                auth_deadline_ms: 10_000,
            },
            presence: PresenceConfig {
                ttl: Duration::from_secs(120),
                heartbeat_interval: Duration::from_millis(30_000),
                offline_ttl_multiplier: 10,
            },
            typing_ttl: Duration::from_secs(5),
            rate_limits: RateLimitPolicies::default(),
            auth: AuthConfig {
                jwt_secret: "change-me-in-production".to_string(),
                token_ttl: Duration::from_secs(7 * 24 * 3600),
                max_sign_in_failures: 5,
                lockout: Duration::from_secs(15 * 60),
                kdf_memory_kib: 19 * 1024,
                kdf_iterations: 2,
            },
            storage: StorageBackend::Memory,
            coordination: CoordinationBackend::Memory,
            media: MediaConfig {
                dir: "./uploads".to_string(),
                max_file_bytes: 10 * 1024 * 1024,
                allowed_mime_types: vec![
                    "image/jpeg".to_string(),
                    "image/png".to_string(),
                    "image/gif".to_string(),
                    "image/webp".to_string(),
                ],
                public_base_url: "http://127.0.0.1:8080".to_string(),
            },
            webhook: WebhookConfig {
                enabled: false,
                url: None,
                secret: None,
                timeout_ms: 3000,
            },
            peers: Vec::new(),
            cluster_secret: "change-me-cluster-secret".to_string(),
        }
    }
}

fn policy(cm: &ConfigManager, name: &str, fallback: RateLimitPolicy) -> RateLimitPolicy {
    RateLimitPolicy {
        max: cm.get_or(&format!("rate_limit.{}.max", name), fallback.max),
        window: Duration::from_millis(cm.get_or(
            &format!("rate_limit.{}.window_ms", name),
            fallback.window.as_millis() as u64,
        )),
    }
}

/// 读取配置（缺失项使用默认值）/ Load configuration, falling back to defaults
pub fn load(cm: &ConfigManager) -> ChatConfig {
    let d = ChatConfig::default();

    let mut rate_limits = RateLimitPolicies {
        policies: HashMap::new(),
        default: policy(cm, "default", d.rate_limits.default),
    };
    for (name, fallback) in d.rate_limits.policies.iter() {
        rate_limits
            .policies
            .insert(name.clone(), policy(cm, name, *fallback));
    }

    let storage = match cm
        .get_or("storage.backend", "memory".to_string())
        .to_lowercase()
        .as_str()
    {
        "postgres" | "postgresql" => StorageBackend::Postgres,
        _ => StorageBackend::Memory,
    };
    let coordination = match cm
        .get_or("coordination.backend", "memory".to_string())
        .to_lowercase()
        .as_str()
    {
        "redis" => CoordinationBackend::Redis {
            url: cm.get_or(
                "coordination.redis_url",
                "redis://127.0.0.1:6379".to_string(),
            ),
        },
        _ => CoordinationBackend::Memory,
    };

    ChatConfig {
        server: ServerConfig {
            host: cm.get_or("server.host", d.server.host),
            ws_port: cm.get_or("server.ws_port", d.server.ws_port as i64) as u16,
            http_port: cm.get_or("server.http_port", d.server.http_port as i64) as u16,
            node_id: cm.get_or("server.node_id", d.server.node_id),
            auth_deadline_ms: cm.get_or("server.auth_deadline_ms", d.server.auth_deadline_ms),
        },
        presence: PresenceConfig {
            ttl: Duration::from_secs(cm.get_or("presence.ttl_secs", 120_u64)),
            heartbeat_interval: Duration::from_millis(cm.get_or("presence.heartbeat_ms", 30_000_u64)),
            offline_ttl_multiplier: cm.get_or(
                "presence.offline_ttl_multiplier",
                d.presence.offline_ttl_multiplier,
            ),
        },
        typing_ttl: Duration::from_secs(cm.get_or("typing.ttl_secs", 5_u64)),
        rate_limits,
        auth: AuthConfig {
            jwt_secret: cm.get_or("auth.jwt_secret", d.auth.jwt_secret),
            token_ttl: Duration::from_secs(cm.get_or("auth.token_ttl_secs", 604_800_u64)),
            max_sign_in_failures: cm.get_or("auth.max_sign_in_failures", d.auth.max_sign_in_failures),
            lockout: Duration::from_secs(cm.get_or(
                "auth.lockout_secs",
                d.auth.lockout.as_secs(),
            )),
            kdf_memory_kib: cm.get_or("auth.kdf_memory_kib", d.auth.kdf_memory_kib),
            kdf_iterations: cm.get_or("auth.kdf_iterations", d.auth.kdf_iterations),
        },
        storage,
        coordination,
        media: MediaConfig {
            dir: cm.get_or("media.dir", d.media.dir),
            max_file_bytes: cm.get_or("media.max_file_bytes", d.media.max_file_bytes as u64) as usize,
            allowed_mime_types: cm.get_or("media.allowed_mime_types", d.media.allowed_mime_types),
            public_base_url: cm.get_or("media.public_base_url", d.media.public_base_url),
        },
        webhook: WebhookConfig {
            enabled: cm.get_or("webhook.enabled", false),
            url: cm.get::<String>("webhook.url").ok(),
            secret: cm.get::<String>("webhook.secret").ok(),
            timeout_ms: cm.get_or("webhook.timeout_ms", d.webhook.timeout_ms),
        },
        peers: cm.get_or("cluster.peers", Vec::new()),
        cluster_secret: cm.get_or("cluster.secret", d.cluster_secret),
    }
}
