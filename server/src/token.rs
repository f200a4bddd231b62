//! Join-token verification.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use roomcast_protocol::{TokenClaims, TokenSecret, TOKEN_SUBJECT};

/// Verifies the signed join token presented as a socket's first frame.
/// Requires an HS256 signature with the shared secret, subject `joinRoom`
/// and an unexpired `exp` (no leeway).
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &TokenSecret) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.sub = Some(TOKEN_SUBJECT.to_string());
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, jsonwebtoken::errors::Error> {
        Ok(decode::<TokenClaims>(token, &self.key, &self.validation)?.claims)
    }
}
