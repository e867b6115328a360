use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// 令牌声明 / Bearer token claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub phone: String,
    pub exp: usize,
}

/// HS256 令牌签发与校验 / HS256 bearer token issuer and verifier
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, user_id: &str, phone: &str) -> ChatResult<String> {
        let exp = chrono::Utc::now().timestamp() as usize + self.ttl.as_secs() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            phone: phone.to_string(),
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ChatError::Infrastructure(format!("token signing failed: {}", e)))
    }

    pub fn verify(&self, token: &str) -> ChatResult<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|_| ChatError::Authentication("Invalid or expired token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_then_verify() {
        let issuer = TokenIssuer::new("secret", Duration::from_secs(60));
        let token = issuer.issue("u1", "555").unwrap();
        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.phone, "555");
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let token = TokenIssuer::new("a", Duration::from_secs(60))
            .issue("u1", "555")
            .unwrap();
        let err = TokenIssuer::new("b", Duration::from_secs(60))
            .verify(&token)
            .unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_ERROR");
    }
}
