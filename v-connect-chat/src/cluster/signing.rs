use hmac::{Hmac, Mac};
use sha2::Sha256;

pub use crate::service::events::sign_body;

/// 节点间请求签名头 / Header carrying the node-to-node body signature
pub const CLUSTER_SIGNATURE_HEADER: &str = "X-VConnectChat-Cluster-Signature";

/// 常数时间校验 `sha256=<hex>` 签名 / Constant-time check of a `sha256=<hex>` signature
pub fn verify_body(body: &[u8], secret: &str, signature: &str) -> bool {
    let Some(digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        Err(_) => false,
    }
}
