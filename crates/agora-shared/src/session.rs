//! Session tokens issued by the external auth service.
//!
//! The auth service signs `{user_id, username, valid_until}` with its Ed25519
//! key. The messaging server only ever verifies tokens; it never issues them
//! outside of tests and local tooling.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionToken {
    pub user_id: Uuid,
    pub username: String,
    pub valid_until: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl SessionToken {
    /// Wire form: base64url (no padding) of the JSON encoding.
    pub fn encode(&self) -> String {
        // Serializing plain data into a Vec cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(encoded: &str) -> Result<Self, SessionError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| SessionError::Malformed(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| SessionError::Malformed(e.to_string()))
    }

    /// Check expiry and signature against the auth service public key.
    pub fn verify_with_key(&self, service_pubkey: &[u8; 32]) -> Result<(), SessionError> {
        if Utc::now() > self.valid_until {
            return Err(SessionError::Expired);
        }

        let verifying_key =
            VerifyingKey::from_bytes(service_pubkey).map_err(|_| SessionError::InvalidServiceKey)?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| SessionError::BadSignature)?;

        verifying_key
            .verify(
                &signing_payload(self.user_id, &self.username, self.valid_until),
                &signature,
            )
            .map_err(|_| SessionError::BadSignature)
    }
}

// payload = user_id || username || 0x00 || valid_until (rfc3339)
fn signing_payload(user_id: Uuid, username: &str, valid_until: DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + username.len() + 1 + 32);
    payload.extend_from_slice(user_id.as_bytes());
    payload.extend_from_slice(username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

pub fn create_session_token(
    user_id: Uuid,
    username: &str,
    valid_until: DateTime<Utc>,
    service_signing_key: &ed25519_dalek::SigningKey,
) -> SessionToken {
    use ed25519_dalek::Signer;

    let signature = service_signing_key.sign(&signing_payload(user_id, username, valid_until));

    SessionToken {
        user_id,
        username: username.to_string(),
        valid_until,
        signature: signature.to_bytes().to_vec(),
    }
}

/// Parse a 64-character hex string into an Ed25519 public key.
pub fn parse_service_pubkey(hex_key: &str) -> Result<[u8; 32], String> {
    let hex_key = hex_key.trim();
    if hex_key.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_key.len()));
    }
    let bytes = hex::decode(hex_key).map_err(|e| e.to_string())?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn service_key() -> (SigningKey, [u8; 32]) {
        let key = SigningKey::generate(&mut OsRng);
        let public = key.verifying_key().to_bytes();
        (key, public)
    }

    #[test]
    fn test_session_token_valid() {
        let (key, public) = service_key();
        let token = create_session_token(
            Uuid::new_v4(),
            "alice",
            Utc::now() + Duration::hours(1),
            &key,
        );
        assert!(token.verify_with_key(&public).is_ok());
    }

    #[test]
    fn test_session_token_survives_wire_encoding() {
        let (key, public) = service_key();
        let token = create_session_token(
            Uuid::new_v4(),
            "bob",
            Utc::now() + Duration::hours(1),
            &key,
        );

        let decoded = SessionToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
        assert!(decoded.verify_with_key(&public).is_ok());
    }

    #[test]
    fn test_session_token_expired() {
        let (key, public) = service_key();
        let token = create_session_token(
            Uuid::new_v4(),
            "alice",
            Utc::now() - Duration::minutes(1),
            &key,
        );
        assert!(matches!(
            token.verify_with_key(&public),
            Err(SessionError::Expired)
        ));
    }

    #[test]
    fn test_session_token_tampered_username() {
        let (key, public) = service_key();
        let mut token = create_session_token(
            Uuid::new_v4(),
            "alice",
            Utc::now() + Duration::hours(1),
            &key,
        );
        token.username = "mallory".to_string();
        assert!(matches!(
            token.verify_with_key(&public),
            Err(SessionError::BadSignature)
        ));
    }

    #[test]
    fn test_session_token_wrong_service_key() {
        let (key, _) = service_key();
        let (_, other_public) = service_key();
        let token = create_session_token(
            Uuid::new_v4(),
            "alice",
            Utc::now() + Duration::hours(1),
            &key,
        );
        assert!(token.verify_with_key(&other_public).is_err());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            SessionToken::decode("not a token!"),
            Err(SessionError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_service_pubkey() {
        let key = parse_service_pubkey(&"ab".repeat(32)).unwrap();
        assert_eq!(key, [0xab; 32]);
        assert!(parse_service_pubkey("abcd").is_err());
        assert!(parse_service_pubkey(&"zz".repeat(32)).is_err());
    }
}
