//! Signed-token verification
//!
//! The gateway only verifies tokens; issuance lives elsewhere. Tokens are
//! HS256-signed with the shared secret and carry the user ID in `sub`.

use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims the gateway cares about
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User ID (customer ID)
    pub sub: String,
    /// Expiry, seconds since epoch
    pub exp: u64,
}

/// Token verification error
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Verifies HS256 tokens and extracts the subject
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify the token signature and expiry, returning the subject (user ID)
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims.sub),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => Err(AuthError::Expired),
                _ => Err(AuthError::Invalid(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) fn issue(secret: &str, sub: &str, ttl_secs: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = Claims {
            sub: sub.to_string(),
            exp: (now + ttl_secs).max(0) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_subject() {
        let verifier = TokenVerifier::new("s3cret");
        let token = issue("s3cret", "customer42", 3600);
        assert_eq!(verifier.verify(&token).unwrap(), "customer42");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = TokenVerifier::new("s3cret");
        let token = issue("other", "customer42", 3600);
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = TokenVerifier::new("s3cret");
        let token = issue("s3cret", "customer42", -3600);
        assert!(matches!(verifier.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn test_garbage_rejected() {
        let verifier = TokenVerifier::new("s3cret");
        assert!(verifier.verify("not-a-token").is_err());
    }
}
