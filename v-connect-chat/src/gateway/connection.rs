use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::gateway::ChatGateway;

/// 处理新连接 / Handle new connection
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    gateway: ChatGateway,
) -> Result<()> {
    tracing::info!("📨 New connection from: {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (conn, mut rx) = gateway.attach_connection(Some(peer_addr));
    let connection_id = conn.id.clone();

    let writer_id = connection_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(&msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                tracing::error!("Failed to send message to {}: {}", writer_id, e);
                break;
            }
            if is_close {
                let _ = ws_sender.close().await;
                break;
            }
        }
    });
    tracing::info!("✅ Connection {} accepted from {}", connection_id, peer_addr);

    // 鉴权期限 / Anonymous connections are closed after the deadline
    {
        let deadline = Duration::from_millis(gateway.config.server.auth_deadline_ms);
        let watchdog_gateway = gateway.clone();
        let watchdog_conn = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if !watchdog_conn.is_authenticated() && !watchdog_conn.is_closed() {
                tracing::warn!("disconnecting unauthenticated connection {}", watchdog_conn.id);
                watchdog_gateway.send_close(&watchdog_conn.id, "Authentication timeout");
                watchdog_gateway.disconnect(&watchdog_conn.id).await;
            }
        });
    }

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                gateway.handle_text(&conn, &text).await;
            }
            Ok(Message::Ping(payload)) => {
                conn.touch();
                conn.send_raw(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) => conn.touch(),
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                tracing::debug!("Ignoring non-text frame from {}", connection_id);
            }
            Err(e) => {
                tracing::error!("WebSocket error from {}: {}", connection_id, e);
                break;
            }
        }
        if conn.is_closed() {
            break;
        }
    }

    gateway.disconnect(&connection_id).await;
    drop(conn);
    if tokio::time::timeout(Duration::from_millis(500), &mut send_task).await.is_err() {
        send_task.abort();
    }
    tracing::info!("👋 Connection {} from {} finished", connection_id, peer_addr);
    Ok(())
}
