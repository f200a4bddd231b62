//! Join-token issuance.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, EncodingKey, Header};
use roomcast_protocol::{TokenClaims, TokenSecret, TOKEN_SUBJECT};
use serde_json::Value;

/// What a token should grant: one client identity into one room on one
/// room server.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub public_url: String,
    pub room_id: String,
    /// Applied only if the join ends up creating the room.
    pub room_properties: Option<Value>,
    pub client_id: String,
    pub client_properties: Option<Value>,
    /// Refuse the join when the room does not already exist.
    pub join_only: bool,
    /// Overrides the issuer's default lifetime.
    pub ttl: Option<Duration>,
}

impl TokenRequest {
    pub fn new(
        public_url: impl Into<String>,
        room_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            public_url: public_url.into(),
            room_id: room_id.into(),
            room_properties: None,
            client_id: client_id.into(),
            client_properties: None,
            join_only: false,
            ttl: None,
        }
    }
}

/// Signs join tokens with the fleet's shared secret, subject `joinRoom`.
pub struct TokenIssuer {
    key: EncodingKey,
    default_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &TokenSecret, default_ttl: Duration) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
            default_ttl,
        }
    }

    pub fn issue(&self, request: TokenRequest) -> Result<String, jsonwebtoken::errors::Error> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let ttl = request.ttl.unwrap_or(self.default_ttl);

        let claims = TokenClaims {
            sub: TOKEN_SUBJECT.to_string(),
            exp: now + ttl.as_secs(),
            public_url: request.public_url,
            room_id: request.room_id,
            room_properties: request.room_properties,
            client_id: request.client_id,
            client_properties: request.client_properties,
            join_only: request.join_only,
        };
        encode(&Header::default(), &claims, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
    use serde_json::json;

    fn decode_claims(token: &str, secret: &[u8]) -> TokenClaims {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.sub = Some(TOKEN_SUBJECT.to_string());
        decode::<TokenClaims>(token, &DecodingKey::from_secret(secret), &validation)
            .unwrap()
            .claims
    }

    #[test]
    fn issued_tokens_carry_the_request() {
        let issuer = TokenIssuer::new(
            &TokenSecret::new(b"secret".to_vec()),
            Duration::from_secs(60),
        );
        let mut request = TokenRequest::new("rs-a", "R1", "C1");
        request.room_properties = Some(json!({"topic": "lobby"}));
        request.join_only = true;

        let claims = decode_claims(&issuer.issue(request).unwrap(), b"secret");
        assert_eq!(claims.sub, TOKEN_SUBJECT);
        assert_eq!(claims.public_url, "rs-a");
        assert_eq!(claims.room_id, "R1");
        assert_eq!(claims.client_id, "C1");
        assert_eq!(claims.room_properties, Some(json!({"topic": "lobby"})));
        assert!(claims.join_only);
    }

    #[test]
    fn ttl_override_extends_expiry() {
        let issuer = TokenIssuer::new(
            &TokenSecret::new(b"secret".to_vec()),
            Duration::from_secs(60),
        );
        let mut request = TokenRequest::new("rs-a", "R1", "C1");
        request.ttl = Some(Duration::from_secs(600));

        let claims = decode_claims(&issuer.issue(request).unwrap(), b"secret");
        let default_claims = decode_claims(
            &issuer.issue(TokenRequest::new("rs-a", "R1", "C2")).unwrap(),
            b"secret",
        );
        assert!(claims.exp >= default_claims.exp + 500);
    }
}
