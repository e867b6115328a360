use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::gateway::ChatGateway;

/// 单轮巡检结果 / Outcome of one sweep
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub refreshed: usize,
    pub closed: usize,
}

/// 刷新存活连接的在线 TTL，关闭空闲超时连接
/// Refresh presence TTLs for live connections and close idle ones
pub async fn sweep_connections(gateway: &ChatGateway, idle_timeout: Duration) -> SweepReport {
    let mut report = SweepReport::default();
    let snapshot: Vec<_> = gateway
        .connections
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    for conn in snapshot {
        if conn.is_closed() {
            continue;
        }
        if conn.idle_for() > idle_timeout {
            info!("⏰ Closing idle connection {}", conn.id);
            gateway.send_close(&conn.id, "Connection timeout");
            gateway.disconnect(&conn.id).await;
            report.closed += 1;
            continue;
        }
        if let Some(user_id) = conn.user_id() {
            match gateway.services.presence.heartbeat(user_id, &conn.id).await {
                Ok(()) => report.refreshed += 1,
                Err(e) => warn!("⚠️  presence refresh failed for {}: {}", conn.id, e),
            }
        }
    }
    debug!("heartbeat sweep: {:?}", report);
    report
}

pub fn spawn_heartbeat_task(gateway: ChatGateway, mut shutdown_rx: watch::Receiver<bool>) {
    let every = gateway.config.presence.heartbeat_interval;
    let idle_timeout = gateway.config.presence.ttl;
    tokio::spawn(async move {
        info!(
            "⏰ Heartbeat sweep every {}ms, idle timeout {}s",
            every.as_millis(),
            idle_timeout.as_secs()
        );
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_connections(&gateway, idle_timeout).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
        info!("heartbeat sweep stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::gateway;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_sweep_refreshes_then_closes_idle() {
        let (gw, _coord, _tmp) = gateway("n");
        let (conn, _rx) = gw.attach_connection(None);
        let creds = json!({"phoneNumber": "100", "username": "ann", "passcode": "pw"});
        let frame = |ev: &str| crate::domain::event::ChatEvent::new(ev, creds.clone()).to_text();
        gw.handle_text(&conn, &frame("register")).await;
        gw.handle_text(&conn, &frame("signIn")).await;
        let user_id = conn.user_id().unwrap().to_string();

        let report = sweep_connections(&gw, Duration::from_secs(120)).await;
        assert_eq!(report, SweepReport { refreshed: 1, closed: 0 });

        tokio::time::advance(Duration::from_secs(121)).await;
        let report = sweep_connections(&gw, Duration::from_secs(120)).await;
        assert_eq!(report, SweepReport { refreshed: 0, closed: 1 });
        assert!(conn.is_closed());
        assert!(!gw.services.presence.is_online(&user_id).await);
    }
}
