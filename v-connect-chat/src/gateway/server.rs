use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::gateway::ChatGateway;

/// 启动WS监听 / Start WS listener
impl ChatGateway {
    pub async fn run(&self, host: &str, port: u16) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr).await?;
        info!("🚀 v-connect-chat WebSocket Server starting on {}", addr);
        info!("📡 Waiting for connections...");

        while let Ok((stream, peer_addr)) = listener.accept().await {
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    crate::gateway::connection::handle_connection(stream, peer_addr, gateway).await
                {
                    tracing::error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }

        Ok(())
    }
}
