pub mod basic;
pub mod live;
pub mod ready;

use v::{HealthCheck, HealthStatus};

use crate::gateway::ChatGateway;

/// 依次检查持久化与协调存储 / Check the durable and coordination stores in turn
pub async fn collect(gateway: &ChatGateway) -> Vec<HealthStatus> {
    let services = &gateway.services;
    vec![
        services.stores.health.check_health().await,
        crate::coord::check_health(services.coord.as_ref()).await,
    ]
}
