use dashmap::DashMap;
use std::sync::Arc;

use crate::config::PeerConfig;
use crate::gateway::ChatGateway;

/// 投递路径 / Delivery route to another node
#[derive(Clone)]
pub enum Route {
    /// 同进程网关 / Gateway living in this process
    Local(ChatGateway),
    /// 远端节点HTTP基址 / Remote node base url
    Remote(String),
}

/// 目录服务 / Directory service
#[derive(Clone, Default)]
pub struct Directory {
    pub peers: Arc<DashMap<String, String>>, // 节点到HTTP基址 / Node -> base url
    pub gateways: Arc<DashMap<String, ChatGateway>>, // 节点到进程内网关 / Node -> in-process gateway
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: &[PeerConfig]) -> Self {
        let dir = Self::new();
        for peer in peers {
            dir.register_peer(&peer.node_id, &peer.url);
        }
        dir
    }

    pub fn register_peer(&self, node_id: &str, url: &str) {
        self.peers
            .insert(node_id.to_string(), url.trim_end_matches('/').to_string());
    }

    pub fn register_gateway(&self, node_id: &str, gateway: ChatGateway) {
        self.gateways.insert(node_id.to_string(), gateway);
    }

    /// 进程内网关优先 / In-process gateways win over HTTP peers
    pub fn route(&self, node_id: &str) -> Option<Route> {
        if let Some(gw) = self.gateways.get(node_id) {
            return Some(Route::Local(gw.value().clone()));
        }
        self.peers.get(node_id).map(|url| Route::Remote(url.clone()))
    }

    /// 除自身外的全部节点路径 / Routes to every node except `self_node`
    pub fn routes_except(&self, self_node: &str) -> Vec<Route> {
        let mut nodes: Vec<String> = self
            .gateways
            .iter()
            .map(|e| e.key().clone())
            .chain(self.peers.iter().map(|e| e.key().clone()))
            .filter(|n| n != self_node)
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes.iter().filter_map(|n| self.route(n)).collect()
    }

    pub fn list_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        nodes.extend(self.gateways.iter().map(|e| e.key().clone()));
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_routes_exclude_self() {
        let dir = Directory::with_peers(&[
            PeerConfig {
                node_id: "node-a".into(),
                url: "http://a:8080/".into(),
            },
            PeerConfig {
                node_id: "node-b".into(),
                url: "http://b:8080".into(),
            },
        ]);
        let routes = dir.routes_except("node-a");
        assert_eq!(routes.len(), 1);
        match &routes[0] {
            Route::Remote(url) => assert_eq!(url, "http://b:8080"),
            Route::Local(_) => panic!("unexpected local route"),
        }
        match dir.route("node-a") {
            Some(Route::Remote(url)) => assert_eq!(url, "http://a:8080"),
            _ => panic!("missing route"),
        }
        assert_eq!(dir.list_nodes(), vec!["node-a", "node-b"]);
    }
}
