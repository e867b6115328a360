use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use v_connect_chat::cluster::Directory;
use v_connect_chat::config::{self, ChatConfig, CoordinationBackend, StorageBackend};
use v_connect_chat::coord::{CoordinationStore, MemoryCoordStore};
use v_connect_chat::gateway::ChatGateway;
use v_connect_chat::service::{events, LocalMediaStore, Services};
use v_connect_chat::storage::{PgStore, Stores};
use v_connect_chat::tasks;

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-connect-chat WebSocket & HTTP Server", long_about = None)]
pub struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config", default_value = "config/default.toml")]
    config: String,
}

async fn open_stores(cfg: &ChatConfig) -> Result<Stores> {
    match cfg.storage {
        StorageBackend::Memory => {
            warn!("💾 Using in-memory durable store (data is lost on restart)");
            Ok(Stores::memory())
        }
        StorageBackend::Postgres => {
            // 启动时持久化存储不可达视为致命 / Unreachable durable store is fatal at startup
            let store = PgStore::connect("default").await?;
            info!("💾 PostgreSQL store ready");
            Ok(Stores::postgres(store))
        }
    }
}

/// 协调存储；进程内实现同时返回以便定期清理
/// Coordination store, plus the in-process instance when it needs sweeping
async fn open_coordination(
    cfg: &ChatConfig,
) -> Result<(Arc<dyn CoordinationStore>, Option<Arc<MemoryCoordStore>>)> {
    match &cfg.coordination {
        CoordinationBackend::Memory => {
            info!("🧭 Using in-memory coordination store (single process)");
            let store = Arc::new(MemoryCoordStore::new());
            Ok((store.clone(), Some(store)))
        }
        #[cfg(feature = "redis")]
        CoordinationBackend::Redis { url } => {
            let store = v_connect_chat::coord::RedisCoordStore::connect(url).await?;
            info!("🧭 Redis coordination store connected: {}", url);
            Ok((Arc::new(store), None))
        }
        #[cfg(not(feature = "redis"))]
        CoordinationBackend::Redis { .. } => Err(anyhow::anyhow!(
            "coordination.backend = \"redis\" requires building with --features redis"
        )),
    }
}

/// 启动HTTP服务器 / Start HTTP server
async fn start_http_server(gateway: ChatGateway, host: String, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    info!("🌐 HTTP Server starting on http://{}", addr);
    info!("   GET  /v1/health, /v1/health/live, /v1/health/ready");
    info!("   POST /v1/media/upload?receiver=<phone>&clientMessageId=<id>");
    info!("   GET  /media/{{id}}");
    info!("   GET  /v1/schema/events");

    HttpServer::new(move || {
        App::new()
            .wrap(
                actix_web::middleware::DefaultHeaders::new()
                    .add(("Access-Control-Allow-Origin", "*"))
                    .add(("Access-Control-Allow-Headers", "*"))
                    .add(("Access-Control-Allow-Methods", "GET, POST, OPTIONS")),
            )
            .app_data(web::Data::new(gateway.clone()))
            .configure(v_connect_chat::router::configure)
    })
    .bind(addr)?
    .run()
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化全局配置 / Initialize global config
    v::init_global_config_with_file(&args.config)?;
    // 初始化日志 / Initialize logging
    v::init_tracing()?;
    info!("🎯 Starting v-connect-chat Server (WebSocket + HTTP)...");

    let cm = v::get_global_config_manager()?;
    for source in cm.sources_info() {
        info!(
            "🔧 config source [{}] {} (priority {}, loaded: {})",
            source.source_type, source.description, source.priority, source.loaded
        );
    }
    let cfg = Arc::new(config::load(&cm));

    let stores = open_stores(&cfg).await?;
    let (coord, memory_coord) = open_coordination(&cfg).await?;
    let media = Arc::new(LocalMediaStore::new(&cfg.media));
    let publisher = events::from_config(&cfg.webhook);
    let services = Services::new(&cfg, stores, coord, media, publisher);

    let directory = Arc::new(Directory::with_peers(&cfg.peers));
    if !cfg.peers.is_empty() {
        info!("🕸️  Cluster peers: {:?}", directory.list_nodes());
    }
    let gateway = ChatGateway::new(cfg.clone(), services, directory);
    info!("🆔 Node id: {}", gateway.node_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tasks::heartbeat::spawn_heartbeat_task(gateway.clone(), shutdown_rx.clone());
    if let Some(store) = memory_coord {
        tasks::coord_sweep::spawn_coord_sweep_task(
            store,
            cfg.presence.heartbeat_interval,
            shutdown_rx,
        );
    }

    let ws_gateway = gateway.clone();
    let ws_host = cfg.server.host.clone();
    let ws_port = cfg.server.ws_port;
    let ws_future = async move {
        if let Err(e) = ws_gateway.run(&ws_host, ws_port).await {
            error!("❌ WebSocket server error: {}", e);
        }
    };

    let http_future = start_http_server(gateway.clone(), cfg.server.host.clone(), cfg.server.http_port);

    // 等待服务器运行或收到退出信号 / Run until a server stops or ctrl-c
    tokio::select! {
        _ = ws_future => {
            info!("WebSocket server stopped");
        }
        res = http_future => {
            if let Err(e) = res {
                error!("❌ HTTP server error: {}", e);
            }
            info!("HTTP server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
    }

    if let Err(e) = shutdown_tx.send(true) {
        warn!("⚠️  Background tasks already stopped: {}", e);
    }
    let ids: Vec<String> = gateway.connections.iter().map(|c| c.key().clone()).collect();
    for id in ids {
        gateway.send_close(&id, "Server shutting down");
        gateway.disconnect(&id).await;
    }
    info!("✅ Server shutdown successfully");
    Ok(())
}
