//! v-connect-chat：实时消息与在线状态服务
//! v-connect-chat: real-time messaging and presence server
//!
//! 分层 / Layers:
//! - `gateway`：WebSocket 连接、鉴权、扇出 / connections, auth, fan-out
//! - `service`：会话、消息、在线、输入、限流、用户、通话 / domain services
//! - `storage`：持久化存储（内存 / PostgreSQL）/ durable stores
//! - `coord`：共享 TTL 协调存储（内存 / Redis）/ shared TTL coordination store
//! - `api`：actix-web HTTP 接口 / HTTP endpoints

pub mod api;
pub mod cluster;
pub mod config;
pub mod coord;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod router;
pub mod service;
pub mod storage;
pub mod tasks;

pub use error::{ChatError, ChatResult};
pub use gateway::ChatGateway;
