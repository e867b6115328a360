use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

use crate::config::AuthConfig;
use crate::domain::User;
use crate::error::{ChatError, ChatResult};

/// 口令校验能力：唯一方法，唯一契约
/// Credential verification capability with a single method
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, user: &User, passcode: &str) -> bool;
}

/// Argon2id 口令哈希（PHC 字符串存储）/ Argon2id passcode hashing stored as PHC strings
#[derive(Clone)]
pub struct PasscodeHasher {
    argon: Argon2<'static>,
}

impl PasscodeHasher {
    /// 参数越界时回退到 Argon2 默认值 / Out-of-range cost parameters fall back to Argon2 defaults
    pub fn new(memory_kib: u32, iterations: u32) -> Self {
        let params = Params::new(memory_kib.max(Params::MIN_M_COST), iterations.max(1), 1, None)
            .unwrap_or_default();
        Self {
            argon: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    pub fn from_config(auth: &AuthConfig) -> Self {
        Self::new(auth.kdf_memory_kib, auth.kdf_iterations)
    }

    /// 生成口令哈希 / Hash a passcode with a fresh random salt
    pub fn hash(&self, passcode: &str) -> ChatResult<String> {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let salt = SaltString::encode_b64(&raw)
            .map_err(|e| ChatError::Infrastructure(format!("salt encoding failed: {}", e)))?;
        self.argon
            .hash_password(passcode.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ChatError::Infrastructure(format!("passcode hashing failed: {}", e)))
    }
}

/// 校验 Argon2 PHC 哈希；参数取自存储串本身
/// Verifies Argon2 PHC hashes; cost parameters come from the stored string
#[derive(Clone)]
pub struct HashedPasscodeVerifier {
    hasher: PasscodeHasher,
}

impl HashedPasscodeVerifier {
    pub fn new(hasher: PasscodeHasher) -> Self {
        Self { hasher }
    }
}

impl CredentialVerifier for HashedPasscodeVerifier {
    fn verify(&self, user: &User, passcode: &str) -> bool {
        match PasswordHash::new(&user.passcode_hash) {
            Ok(parsed) => self
                .hasher
                .argon
                .verify_password(passcode.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }
}
