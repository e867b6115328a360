//! 多进程协作 / Multi-process cooperation
//!
//! 连接ID带有所属节点前缀，跨节点投递经由目录服务定位
//! Connection ids carry their owning node; the directory routes cross-node delivery

pub mod directory;
pub mod signing;

pub use directory::{Directory, Route};
pub use signing::{verify_body, CLUSTER_SIGNATURE_HEADER};

/// 从连接ID解析所属节点 / Owning node of a `{node_id}:{uuid}` connection id
pub fn owner_node(connection_id: &str) -> Option<&str> {
    connection_id.rsplit_once(':').map(|(node, _)| node)
}
