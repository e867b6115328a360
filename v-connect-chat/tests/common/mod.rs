//! 集成测试公共工具 / Shared helpers for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;

use v_connect_chat::cluster::Directory;
use v_connect_chat::config::ChatConfig;
use v_connect_chat::coord::{CoordinationStore, MemoryCoordStore};
use v_connect_chat::domain::event::ChatEvent;
use v_connect_chat::gateway::{ChatGateway, Connection};
use v_connect_chat::service::{LocalMediaStore, NoopPublisher, Services};
use v_connect_chat::storage::Stores;

/// 测试节点：共享存储、协调存储与目录 / Test node sharing stores, coordination and directory
pub struct Shared {
    pub stores: Stores,
    pub coord: Arc<MemoryCoordStore>,
    pub directory: Arc<Directory>,
    pub media_dir: tempfile::TempDir,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            stores: Stores::memory(),
            coord: Arc::new(MemoryCoordStore::new()),
            directory: Arc::new(Directory::new()),
            media_dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn config(&self, node_id: &str) -> ChatConfig {
        let mut cfg = ChatConfig::default();
        cfg.server.node_id = node_id.to_string();
        cfg.media.dir = self.media_dir.path().to_string_lossy().to_string();
        cfg.auth.kdf_memory_kib = 1024;
        cfg.auth.kdf_iterations = 1;
        cfg
    }

    pub fn node(&self, node_id: &str) -> ChatGateway {
        self.node_with(self.config(node_id))
    }

    pub fn node_with(&self, cfg: ChatConfig) -> ChatGateway {
        let coord: Arc<dyn CoordinationStore> = self.coord.clone();
        let services = Services::new(
            &cfg,
            self.stores.clone(),
            coord,
            Arc::new(LocalMediaStore::new(&cfg.media)),
            Arc::new(NoopPublisher),
        );
        ChatGateway::new(Arc::new(cfg), services, self.directory.clone())
    }
}

/// 测试客户端 / A connection plus its outbound queue
pub struct Client {
    pub conn: Arc<Connection>,
    pub rx: UnboundedReceiver<Message>,
}

impl Client {
    pub fn open(gateway: &ChatGateway) -> Self {
        let (conn, rx) = gateway.attach_connection(None);
        Self { conn, rx }
    }

    pub async fn send(&self, gateway: &ChatGateway, event: &str, data: Value) {
        gateway
            .handle_text(&self.conn, &ChatEvent::new(event, data).to_text())
            .await;
    }

    pub fn drain(&mut self) -> Vec<ChatEvent> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            if let Message::Text(text) = msg {
                if let Ok(ev) = serde_json::from_str::<ChatEvent>(&text) {
                    out.push(ev);
                }
            }
        }
        out
    }

    pub fn user_id(&self) -> String {
        self.conn.user_id().unwrap_or_default().to_string()
    }
}

pub fn find<'a>(events: &'a [ChatEvent], name: &str) -> Option<&'a ChatEvent> {
    events.iter().find(|e| e.event == name)
}

pub fn count(events: &[ChatEvent], name: &str) -> usize {
    events.iter().filter(|e| e.event == name).count()
}

/// 注册并登录，返回已鉴权客户端 / Register, sign in and return an authenticated client
pub async fn signed_in(gateway: &ChatGateway, phone: &str, username: &str) -> Client {
    let mut client = Client::open(gateway);
    let creds = json!({"phoneNumber": phone, "username": username, "passcode": "secret"});
    client.send(gateway, "register", creds.clone()).await;
    client.send(gateway, "signIn", creds).await;
    let events = client.drain();
    assert!(
        find(&events, "signInSuccess").is_some(),
        "sign in failed: {:?}",
        events
    );
    client
}

/// 已有账号的新连接 / New connection for an existing account
pub async fn sign_in_again(gateway: &ChatGateway, phone: &str, username: &str) -> Client {
    let mut client = Client::open(gateway);
    client
        .send(
            gateway,
            "signIn",
            json!({"phoneNumber": phone, "username": username, "passcode": "secret"}),
        )
        .await;
    let events = client.drain();
    assert!(find(&events, "signInSuccess").is_some(), "sign in failed: {:?}", events);
    client
}
