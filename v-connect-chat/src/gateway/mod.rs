//! 实时网关 / Real-time gateway
//!
//! 每个连接：CONNECTED（匿名）→ AUTHENTICATED（绑定身份）→ CLOSED
//! Per connection: CONNECTED (anonymous) → AUTHENTICATED (identity bound) → CLOSED

pub mod connection;
pub mod context;
pub mod handler;
pub mod sender;
pub mod server;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::cluster::Directory;
use crate::config::ChatConfig;
use crate::domain::event::ChatEvent;
use crate::error::{ChatError, ChatResult};
use crate::service::Services;

pub use context::ConnectionContext;

/// 客户端连接 / Client connection
pub struct Connection {
    pub id: String,                               // `{node_id}:{uuid}`
    pub addr: Option<SocketAddr>,                 // 客户端地址 / Client address
    sender: mpsc::UnboundedSender<Message>,       // 出站队列 / Outbound queue
    context: OnceLock<ConnectionContext>,         // 鉴权上下文 / Identity, set once
    closed: AtomicBool,                           // 断开只处理一次 / Disconnect guard
    last_activity: Mutex<Instant>,                // 最近客户端活动 / Last client activity
}

impl Connection {
    pub fn context(&self) -> Option<&ConnectionContext> {
        self.context.get()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.context.get().map(|c| c.user_id.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.context.get().is_some()
    }

    /// 绑定身份；重复鉴权失败 / Bind identity; a second attempt fails
    pub fn bind(&self, ctx: ConnectionContext) -> ChatResult<()> {
        self.context
            .set(ctx)
            .map_err(|_| ChatError::validation("Already authenticated"))
    }

    pub fn send_text(&self, text: String) -> bool {
        self.sender.send(Message::Text(text)).is_ok()
    }

    pub fn send_event(&self, event: &ChatEvent) -> bool {
        self.send_text(event.to_text())
    }

    pub(crate) fn send_raw(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 首次调用返回 true / True only for the first caller
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// 网关全局状态 / Gateway state shared by every connection task
#[derive(Clone)]
pub struct ChatGateway {
    pub node_id: String,                                    // 当前节点ID / Current node ID
    pub config: Arc<ChatConfig>,                            // 配置 / Configuration
    pub services: Services,                                 // 业务服务 / Services
    pub connections: Arc<DashMap<String, Arc<Connection>>>, // 本地连接 / Local connections
    pub user_groups: Arc<DashMap<String, DashSet<String>>>, // `user:{id}` -> connection ids
    pub directory: Arc<Directory>,                          // 目录服务 / Directory service
    http: reqwest::Client,
}

impl ChatGateway {
    /// 创建网关并登记到目录 / Build the gateway and register it in the directory
    pub fn new(config: Arc<ChatConfig>, services: Services, directory: Arc<Directory>) -> Self {
        let gateway = Self {
            node_id: config.server.node_id.clone(),
            config,
            services,
            connections: Arc::new(DashMap::new()),
            user_groups: Arc::new(DashMap::new()),
            directory,
            http: reqwest::Client::new(),
        };
        gateway
            .directory
            .register_gateway(&gateway.node_id, gateway.clone());
        gateway
    }

    /// 登记新连接，返回连接与其出站队列 / Register a connection and hand back its outbound queue
    pub fn attach_connection(
        &self,
        addr: Option<SocketAddr>,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let conn = Arc::new(Connection {
            id: format!("{}:{}", self.node_id, uuid::Uuid::new_v4()),
            addr,
            sender: tx,
            context: OnceLock::new(),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        });
        self.connections.insert(conn.id.clone(), conn.clone());
        conn.send_event(&ChatEvent::new(
            "connected",
            json!({"connectionId": conn.id, "nodeId": self.node_id}),
        ));
        (conn, rx)
    }

    pub fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn group_key(user_id: &str) -> String {
        format!("user:{}", user_id)
    }

    pub(crate) fn join_user_group(&self, user_id: &str, connection_id: &str) {
        self.user_groups
            .entry(Self::group_key(user_id))
            .or_default()
            .insert(connection_id.to_string());
    }

    pub(crate) fn leave_user_group(&self, user_id: &str, connection_id: &str) {
        let key = Self::group_key(user_id);
        if let Some(group) = self.user_groups.get(&key) {
            group.remove(connection_id);
        }
        self.user_groups.remove_if(&key, |_, group| group.is_empty());
    }

    /// 本节点上该用户的连接 / This node's connections for a user
    pub fn local_user_connections(&self, user_id: &str) -> Vec<String> {
        self.user_groups
            .get(&Self::group_key(user_id))
            .map(|g| g.iter().map(|c| c.key().clone()).collect())
            .unwrap_or_default()
    }

    /// 断开处理（每个连接只执行一次）/ Disconnect handling, runs once per connection
    pub async fn disconnect(&self, connection_id: &str) {
        let Some(conn) = self.connection(connection_id) else {
            return;
        };
        if !conn.mark_closed() {
            return;
        }
        self.connections.remove(connection_id);
        let Some(ctx) = conn.context() else {
            info!("👋 Anonymous connection {} closed", connection_id);
            return;
        };
        self.leave_user_group(&ctx.user_id, connection_id);
        info!("👋 Connection {} of user {} closed", connection_id, ctx.user_id);
        match self
            .services
            .presence
            .set_offline_as(&ctx.user_id, connection_id)
            .await
        {
            Ok(Some(transition)) => {
                let event = ChatEvent::new(
                    "userOffline",
                    json!({
                        "userId": transition.user_id,
                        "phoneNumber": ctx.phone_number,
                        "lastSeen": transition.last_seen_at,
                    }),
                );
                self.broadcast(&event).await;
            }
            Ok(None) => {}
            Err(e) => warn!("⚠️  presence cleanup failed for {}: {}", connection_id, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::coord::{CoordinationStore, MemoryCoordStore};
    use crate::service::{LocalMediaStore, NoopPublisher};
    use crate::storage::Stores;

    /// 单节点测试网关 / Single-node gateway over in-memory stores
    pub fn gateway(node_id: &str) -> (ChatGateway, Arc<MemoryCoordStore>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = ChatConfig::default();
        cfg.server.node_id = node_id.to_string();
        cfg.media.dir = tmp.path().to_string_lossy().to_string();
        cfg.auth.kdf_memory_kib = 1024;
        cfg.auth.kdf_iterations = 1;
        let coord = Arc::new(MemoryCoordStore::new());
        let shared: Arc<dyn CoordinationStore> = coord.clone();
        let services = Services::new(
            &cfg,
            Stores::memory(),
            shared,
            Arc::new(LocalMediaStore::new(&cfg.media)),
            Arc::new(NoopPublisher),
        );
        let gw = ChatGateway::new(Arc::new(cfg), services, Arc::new(Directory::new()));
        (gw, coord, tmp)
    }

    /// 取出队列中全部文本事件 / Drain every queued text event
    pub fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ChatEvent> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                if let Ok(ev) = serde_json::from_str::<ChatEvent>(&text) {
                    out.push(ev);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{drain, gateway};
    use super::*;

    #[tokio::test]
    async fn test_attach_sends_welcome_with_node_prefixed_id() {
        let (gw, _coord, _tmp) = gateway("node-x");
        let (conn, mut rx) = gw.attach_connection(None);
        assert!(conn.id.starts_with("node-x:"));
        let events = drain(&mut rx);
        assert_eq!(events[0].event, "connected");
        assert_eq!(events[0].data["connectionId"], conn.id.as_str());
        assert_eq!(gw.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_only_once() {
        let (gw, _coord, _tmp) = gateway("n");
        let (conn, _rx) = gw.attach_connection(None);
        let user = crate::domain::User::new("1", "a", "x$y".into());
        conn.bind(ConnectionContext::for_user(&user)).unwrap();
        let err = conn.bind(ConnectionContext::for_user(&user)).unwrap_err();
        assert_eq!(err.to_string(), "Already authenticated");
        assert_eq!(conn.user_id(), Some(user.id.as_str()));
    }

    #[tokio::test]
    async fn test_disconnect_runs_once() {
        let (gw, _coord, _tmp) = gateway("n");
        let (conn, _rx) = gw.attach_connection(None);
        gw.disconnect(&conn.id).await;
        assert!(conn.is_closed());
        assert_eq!(gw.connection_count(), 0);
        gw.disconnect(&conn.id).await;
        assert_eq!(gw.connection_count(), 0);
    }
}
