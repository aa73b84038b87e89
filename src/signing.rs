//! # Signed object tokens
//!
//! Carries an object reference through the client during a direct upload so
//! the completion callback can be trusted without re-checking bucket scope.
//!
//! Format: `base64url(json) "." base64url(hmac_sha256(secret, salt "." base64url(json)))`.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Salt separating upload tokens from anything else signed with the same secret.
pub const UPLOAD_SALT: &str = "object-upload";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not match")]
    BadSignature,
    #[error("token has expired")]
    Expired,
}

/// What a direct-upload token vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectToken {
    pub object_id: Uuid,
    pub bucket_id: Uuid,
    pub key: String,
    pub filename: String,
    pub issued_at: DateTime<Utc>,
}

/// HMAC signer for [`ObjectToken`]s.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    salt: String,
    max_age: Option<Duration>,
}

impl TokenSigner {
    pub fn new(secret: &[u8], salt: &str, max_age: Option<Duration>) -> Self {
        Self {
            secret: secret.to_vec(),
            salt: salt.to_string(),
            max_age,
        }
    }

    pub fn sign(&self, token: &ObjectToken) -> String {
        // Serializing a struct of plain fields into JSON cannot fail.
        let payload = serde_json::to_vec(token).unwrap_or_default();
        let encoded = URL_SAFE_NO_PAD.encode(payload);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&encoded).finalize().into_bytes());
        format!("{}.{}", encoded, signature)
    }

    pub fn verify(&self, raw: &str, now: DateTime<Utc>) -> Result<ObjectToken, TokenError> {
        let (encoded, signature) = raw.split_once('.').ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        self.mac(encoded)
            .verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenError::Malformed)?;
        let token: ObjectToken =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        if let Some(max_age) = self.max_age {
            if now - token.issued_at > max_age {
                return Err(TokenError::Expired);
            }
        }
        Ok(token)
    }

    fn mac(&self, encoded_payload: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(self.salt.as_bytes());
        mac.update(b".");
        mac.update(encoded_payload.as_bytes());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> ObjectToken {
        ObjectToken {
            object_id: Uuid::new_v4(),
            bucket_id: Uuid::new_v4(),
            key: "2025/3/4/report_abcde.pdf".into(),
            filename: "report_abcde.pdf".into(),
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = TokenSigner::new(b"test-secret", UPLOAD_SALT, None);
        let original = token();
        let raw = signer.sign(&original);
        assert_eq!(signer.verify(&raw, Utc::now()), Ok(original));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let signer = TokenSigner::new(b"test-secret", UPLOAD_SALT, None);
        let raw = signer.sign(&token());
        let (_, signature) = raw.split_once('.').unwrap();

        let mut forged = token();
        forged.key = "2025/3/4/other.pdf".into();
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let forged_raw = format!("{}.{}", forged_payload, signature);

        assert_eq!(
            signer.verify(&forged_raw, Utc::now()),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_other_secret_or_salt_is_rejected() {
        let raw = TokenSigner::new(b"secret-a", UPLOAD_SALT, None).sign(&token());
        let other_secret = TokenSigner::new(b"secret-b", UPLOAD_SALT, None);
        let other_salt = TokenSigner::new(b"secret-a", "something-else", None);
        assert_eq!(other_secret.verify(&raw, Utc::now()), Err(TokenError::BadSignature));
        assert_eq!(other_salt.verify(&raw, Utc::now()), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_garbage_and_expiry() {
        let signer = TokenSigner::new(b"test-secret", UPLOAD_SALT, Some(Duration::hours(1)));
        assert_eq!(signer.verify("no-dot", Utc::now()), Err(TokenError::Malformed));
        assert_eq!(signer.verify("a.!!!", Utc::now()), Err(TokenError::Malformed));

        let raw = signer.sign(&token());
        assert!(signer.verify(&raw, Utc::now() + Duration::minutes(59)).is_ok());
        assert_eq!(
            signer.verify(&raw, Utc::now() + Duration::hours(2)),
            Err(TokenError::Expired)
        );
    }
}
