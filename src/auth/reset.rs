use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::{config::ResetConfig, state::AppState};

const NONCE_LEN: usize = 12;

/// Payload embedded in a reset token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetClaims {
    pub user_id: Uuid,
    pub expires_at_ms: i64,
}

/// Redemption failure. Malformed covers bad format, bad hex, failed
/// decryption and bad JSON alike; the HTTP layer flattens both variants to
/// one generic response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResetTokenError {
    #[error("malformed reset token")]
    Malformed,
    #[error("reset token expired")]
    Expired,
}

/// Issues and redeems password-reset tokens. A token is the JSON claims
/// encrypted under AES-256-GCM with a fresh nonce, wired as
/// `nonceHex:ciphertextHex`.
#[derive(Clone)]
pub struct ResetKeys {
    cipher: Aes256Gcm,
    ttl: Duration,
}

impl FromRef<AppState> for ResetKeys {
    fn from_ref(state: &AppState) -> Self {
        let ResetConfig {
            encryption_key,
            ttl_minutes,
        } = state.config.reset.clone();
        Self::new(&encryption_key, ttl_minutes)
    }
}

impl ResetKeys {
    pub fn new(encryption_key: &str, ttl_minutes: i64) -> Self {
        let digest = Sha256::digest(encryption_key.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest));
        Self {
            cipher,
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    /// Expiry for a token issued now; stored alongside the token on the
    /// user record.
    pub fn expiry_from(&self, now: OffsetDateTime) -> OffsetDateTime {
        now + self.ttl
    }

    pub fn issue(&self, user_id: Uuid) -> anyhow::Result<String> {
        self.issue_at(user_id, OffsetDateTime::now_utc())
    }

    pub fn issue_at(&self, user_id: Uuid, now: OffsetDateTime) -> anyhow::Result<String> {
        let expires_at_ms = (self.expiry_from(now).unix_timestamp_nanos() / 1_000_000) as i64;
        let token = self.encode(&ResetClaims {
            user_id,
            expires_at_ms,
        })?;
        debug!(user_id = %user_id, "reset token issued");
        Ok(token)
    }

    fn encode(&self, claims: &ResetClaims) -> anyhow::Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let plaintext = serde_json::to_vec(claims)?;
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| anyhow::anyhow!("reset token encryption failed"))?;
        Ok(format!("{}:{}", hex::encode(nonce), hex::encode(ciphertext)))
    }

    pub fn redeem(&self, token: &str) -> Result<ResetClaims, ResetTokenError> {
        self.redeem_at(token, OffsetDateTime::now_utc())
    }

    /// Fails closed: any token that does not decrypt to unexpired claims is
    /// rejected, never panics.
    pub fn redeem_at(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<ResetClaims, ResetTokenError> {
        let (nonce_hex, ciphertext_hex) =
            token.split_once(':').ok_or(ResetTokenError::Malformed)?;
        let nonce = hex::decode(nonce_hex).map_err(|_| ResetTokenError::Malformed)?;
        if nonce.len() != NONCE_LEN {
            return Err(ResetTokenError::Malformed);
        }
        let ciphertext = hex::decode(ciphertext_hex).map_err(|_| ResetTokenError::Malformed)?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| ResetTokenError::Malformed)?;
        let claims: ResetClaims =
            serde_json::from_slice(&plaintext).map_err(|_| ResetTokenError::Malformed)?;

        let now_ms = (now.unix_timestamp_nanos() / 1_000_000) as i64;
        if now_ms >= claims.expires_at_ms {
            return Err(ResetTokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_keys() -> ResetKeys {
        ResetKeys::new("test-encryption-key", 60)
    }

    #[test]
    fn redeem_after_issue_returns_user_id() {
        let keys = make_keys();
        let user_id = Uuid::new_v4();
        let token = keys.issue(user_id).expect("issue");
        let claims = keys.redeem(&token).expect("redeem");
        assert_eq!(claims.user_id, user_id);
    }

    #[test]
    fn tokens_are_unique_per_issue() {
        let keys = make_keys();
        let user_id = Uuid::new_v4();
        let a = keys.issue(user_id).expect("issue");
        let b = keys.issue(user_id).expect("issue");
        assert_ne!(a, b);
    }

    #[test]
    fn redeem_rejects_expired_token() {
        let keys = make_keys();
        let issued_at = OffsetDateTime::now_utc();
        let token = keys.issue_at(Uuid::new_v4(), issued_at).expect("issue");
        let later = issued_at + Duration::minutes(61);
        assert_eq!(keys.redeem_at(&token, later), Err(ResetTokenError::Expired));
    }

    #[test]
    fn expiry_instant_is_already_expired() {
        let keys = make_keys();
        let issued_at = OffsetDateTime::now_utc();
        let token = keys.issue_at(Uuid::new_v4(), issued_at).expect("issue");
        let at_expiry = keys.expiry_from(issued_at);
        assert!(keys.redeem_at(&token, at_expiry - Duration::seconds(1)).is_ok());
        assert_eq!(
            keys.redeem_at(&token, at_expiry),
            Err(ResetTokenError::Expired)
        );
    }

    #[test]
    fn one_minute_ttl_expires_after_a_minute() {
        let keys = ResetKeys::new("test-encryption-key", 1);
        let issued_at = OffsetDateTime::now_utc();
        let token = keys.issue_at(Uuid::new_v4(), issued_at).expect("issue");
        assert!(keys.redeem_at(&token, issued_at).is_ok());
        let later = issued_at + Duration::seconds(61);
        assert_eq!(keys.redeem_at(&token, later), Err(ResetTokenError::Expired));
    }

    #[test]
    fn redeem_fails_closed_on_malformed_input() {
        let keys = make_keys();
        for bad in [
            "",
            "no-separator",
            "nothex:deadbeef",
            "deadbeef:nothex",
            ":",
            "deadbeef:",                  // nonce too short
            "000000000000000000000000:",  // empty ciphertext
            "000000000000000000000000:00", // truncated ciphertext
        ] {
            assert_eq!(
                keys.redeem(bad),
                Err(ResetTokenError::Malformed),
                "input: {bad:?}"
            );
        }
    }

    #[test]
    fn redeem_rejects_token_from_another_key() {
        let keys = make_keys();
        let other = ResetKeys::new("a-different-key", 60);
        let token = other.issue(Uuid::new_v4()).expect("issue");
        assert_eq!(keys.redeem(&token), Err(ResetTokenError::Malformed));
    }

    #[test]
    fn redeem_rejects_tampered_ciphertext() {
        let keys = make_keys();
        let token = keys.issue(Uuid::new_v4()).expect("issue");
        let mut tampered = token.clone();
        let last = tampered.pop().expect("non-empty");
        tampered.push(if last == '0' { '1' } else { '0' });
        assert_eq!(keys.redeem(&tampered), Err(ResetTokenError::Malformed));
    }
}
