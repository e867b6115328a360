use std::collections::BTreeSet;

use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::cluster::signing::sign_body;
use crate::cluster::{owner_node, Route, CLUSTER_SIGNATURE_HEADER};
use crate::domain::event::ChatEvent;
use crate::gateway::ChatGateway;

impl ChatGateway {
    /// 在独立任务中向对等节点发送签名请求 / Signed POST to a peer on a detached task
    fn post_to_peer(&self, url: String, body: Value) {
        let payload = match serde_json::to_vec(&body) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("⚠️  Cannot encode request for {}: {}", url, e);
                return;
            }
        };
        let signature = match sign_body(&payload, &self.config.cluster_secret) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("⚠️  Cannot sign request for {}: {}", url, e);
                return;
            }
        };
        let client = self.http.clone();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(CLUSTER_SIGNATURE_HEADER, signature)
                .body(payload)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                warn!("⚠️  Request to {} failed: {}", url, e);
            }
        });
    }

    /// 仅投递到本节点连接 / Deliver to a connection on this node only
    pub fn deliver_local(&self, connection_id: &str, text: String) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => {
                let sent = conn.send_text(text);
                if !sent {
                    warn!("⚠️  Outbound queue closed for {}", connection_id);
                }
                sent
            }
            None => false,
        }
    }

    /// 向任意节点上的连接发送 / Send to a connection owned by any node
    pub async fn emit_to_connection(&self, connection_id: &str, event: &ChatEvent) {
        self.send_text_to_connection(connection_id, event.to_text()).await
    }

    async fn send_text_to_connection(&self, connection_id: &str, text: String) {
        if self.deliver_local(connection_id, text.clone()) {
            debug!("📤 Sent to local connection {}", connection_id);
            return;
        }
        let node = match owner_node(connection_id) {
            Some(node) if node != self.node_id => node,
            _ => {
                debug!("Connection {} is gone, skipping", connection_id);
                return;
            }
        };
        match self.directory.route(node) {
            Some(Route::Local(gateway)) => {
                gateway.deliver_local(connection_id, text);
            }
            Some(Route::Remote(base)) => {
                debug!("📡 Forwarding {} via {}", connection_id, base);
                self.post_to_peer(
                    format!("{}/v1/internal/forward", base),
                    json!({"connectionId": connection_id, "text": text}),
                );
            }
            None => debug!("No route to node {} for {}", node, connection_id),
        }
    }

    /// 向用户全部连接扇出 / Fan out to every connection of a user
    ///
    /// 本地 `user:{id}` 组与在线注册表中的连接取并集
    /// Union of the local `user:{id}` group and the presence registry
    pub async fn emit_to_user(&self, user_id: &str, event: &ChatEvent) {
        let mut targets: BTreeSet<String> = self.local_user_connections(user_id).into_iter().collect();
        targets.extend(self.services.presence.get_user_connections(user_id).await);
        if targets.is_empty() {
            debug!("User {} has no live connections for {}", user_id, event.event);
            return;
        }
        let text = event.to_text();
        for connection_id in targets {
            self.send_text_to_connection(&connection_id, text.clone()).await;
        }
    }

    pub async fn emit_to_users(&self, user_ids: &[String], event: &ChatEvent) {
        for user_id in user_ids {
            self.emit_to_user(user_id, event).await;
        }
    }

    /// 广播到本节点已鉴权连接 / Broadcast to this node's authenticated connections
    pub fn broadcast_local(&self, text: &str) -> usize {
        let mut sent = 0;
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.is_authenticated() && conn.send_text(text.to_string()) {
                sent += 1;
            }
        }
        sent
    }

    /// 全集群广播 / Fleet-wide broadcast
    pub async fn broadcast(&self, event: &ChatEvent) {
        let text = event.to_text();
        self.broadcast_local(&text);
        for route in self.directory.routes_except(&self.node_id) {
            match route {
                Route::Local(gateway) => {
                    gateway.broadcast_local(&text);
                }
                Route::Remote(base) => {
                    self.post_to_peer(
                        format!("{}/v1/internal/broadcast", base),
                        json!({"text": text}),
                    );
                }
            }
        }
    }

    /// 发送关闭帧 / Send a close frame
    pub fn send_close(&self, connection_id: &str, reason: &'static str) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => {
                let sent = conn.send_raw(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: std::borrow::Cow::Borrowed(reason),
                })));
                debug!("🔒 Sent close to {}", connection_id);
                sent
            }
            None => false,
        }
    }
}
