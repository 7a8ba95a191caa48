//! Access token inspection.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{Error, Result},
    identity::models::{User, UserId, UserMetadata},
};

/// Audience the identity service stamps on end-user access tokens
pub const AUTHENTICATED_AUDIENCE: &str = "authenticated";

/// Claims carried by identity service access tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: UserId,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl From<AccessClaims> for User {
    fn from(claims: AccessClaims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email.unwrap_or_default(),
            user_metadata: claims.user_metadata,
        }
    }
}

/// Verify an access token's signature, audience and expiry with the project's JWT secret
pub fn verify_access_token(token: &str, secret: &str) -> Result<AccessClaims> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[AUTHENTICATED_AUDIENCE]);

    let token_data = decode::<AccessClaims>(token, &key, &validation).map_err(|e| match e.kind() {
        // Client errors (401) - malformed tokens, invalid claims, expired tokens
        jsonwebtoken::errors::ErrorKind::InvalidToken
        | jsonwebtoken::errors::ErrorKind::InvalidSignature
        | jsonwebtoken::errors::ErrorKind::ExpiredSignature
        | jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(_)
        | jsonwebtoken::errors::ErrorKind::InvalidIssuer
        | jsonwebtoken::errors::ErrorKind::InvalidAudience
        | jsonwebtoken::errors::ErrorKind::InvalidSubject
        | jsonwebtoken::errors::ErrorKind::ImmatureSignature
        | jsonwebtoken::errors::ErrorKind::Base64(_)
        | jsonwebtoken::errors::ErrorKind::Json(_)
        | jsonwebtoken::errors::ErrorKind::Utf8(_)
        | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => Error::Unauthenticated { message: None },

        // Server errors (500) - key issues, internal failures
        jsonwebtoken::errors::ErrorKind::InvalidEcdsaKey
        | jsonwebtoken::errors::ErrorKind::InvalidRsaKey(_)
        | jsonwebtoken::errors::ErrorKind::RsaFailedSigning
        | jsonwebtoken::errors::ErrorKind::InvalidAlgorithmName
        | jsonwebtoken::errors::ErrorKind::InvalidKeyFormat
        | jsonwebtoken::errors::ErrorKind::MissingAlgorithm
        | jsonwebtoken::errors::ErrorKind::Crypto(_) => Error::Internal {
            operation: format!("JWT verification: {e}"),
        },

        _ => Error::Internal {
            operation: format!("JWT verification (unknown error): {e}"),
        },
    })?;

    Ok(token_data.claims)
}

/// Read `exp` without checking the signature. Only used to decide whether a token needs refreshing;
/// never to trust its contents.
pub fn unverified_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    #[derive(Deserialize)]
    struct Exp {
        exp: i64,
    }

    let data = decode::<Exp>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    DateTime::from_timestamp(data.claims.exp, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    const SECRET: &str = "test-jwt-secret-with-enough-length";

    fn token(exp: i64, aud: &str, secret: &str) -> String {
        let claims = serde_json::json!({
            "sub": Uuid::new_v4(),
            "email": "buyer@example.com",
            "exp": exp,
            "aud": aud,
            "user_metadata": { "role": "retailer" }
        });
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_verify_valid_token() {
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        let claims = verify_access_token(&token(exp, AUTHENTICATED_AUDIENCE, SECRET), SECRET).unwrap();
        let user = User::from(claims);
        assert_eq!(user.email, "buyer@example.com");
        assert_eq!(user.user_metadata.role.as_deref(), Some("retailer"));
    }

    #[test]
    fn test_verify_rejects_wrong_secret_and_audience() {
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();

        let result = verify_access_token(&token(exp, AUTHENTICATED_AUDIENCE, "other-secret"), SECRET);
        assert!(matches!(result.unwrap_err(), Error::Unauthenticated { .. }));

        let result = verify_access_token(&token(exp, "anon", SECRET), SECRET);
        assert!(matches!(result.unwrap_err(), Error::Unauthenticated { .. }));
    }

    #[test]
    fn test_verify_rejects_expired_token() {
        let exp = (Utc::now() - chrono::Duration::hours(1)).timestamp();
        let result = verify_access_token(&token(exp, AUTHENTICATED_AUDIENCE, SECRET), SECRET);
        assert!(matches!(result.unwrap_err(), Error::Unauthenticated { .. }));
    }

    #[test]
    fn test_verify_malformed_tokens() {
        for token in ["not.a.token", "invalid", "", "too.many.parts.in.this.token"] {
            let result = verify_access_token(token, SECRET);
            assert!(
                matches!(result.unwrap_err(), Error::Unauthenticated { .. }),
                "Expected Unauthenticated error for token: {}",
                token
            );
        }
    }

    #[test]
    fn test_unverified_expiry() {
        let exp = (Utc::now() - chrono::Duration::hours(1)).timestamp();
        let expiry = unverified_expiry(&token(exp, AUTHENTICATED_AUDIENCE, "whatever")).unwrap();
        assert_eq!(expiry.timestamp(), exp);

        assert_eq!(unverified_expiry("opaque-token"), None);
    }
}
