//! Authenticated encryption using AES-256-GCM.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// AES-GCM parameters.
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Ambient material for crypto operations: which key to use and anything
/// the operation should bind as associated data.
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    pub key_id: Option<String>,
    /// Additional authenticated data mixed into the tag.
    pub associated_data: Option<Vec<u8>>,
}

impl SecurityContext {
    pub fn with_key_id(key_id: impl Into<String>) -> Self {
        Self {
            key_id: Some(key_id.into()),
            associated_data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncryptionError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    /// Tag verification failed: the ciphertext, nonce or tag was tampered
    /// with, or the wrong key was used.
    #[error("decryption failed: authentication tag did not verify")]
    TagMismatch,

    #[error("malformed encrypted payload: {0}")]
    Malformed(String),
}

/// Ciphertext with its nonce and authentication tag, kept separate so
/// callers can persist or transmit them independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub tag: Vec<u8>,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Authenticated encryption contract.
pub trait MessageEncryptor: Send + Sync {
    fn encrypt(
        &self,
        plaintext: &[u8],
        ctx: &SecurityContext,
    ) -> Result<EncryptedPayload, EncryptionError>;

    fn decrypt(
        &self,
        encrypted: &EncryptedPayload,
        ctx: &SecurityContext,
    ) -> Result<Vec<u8>, EncryptionError>;
}

/// AES-256-GCM encryptor with a base64-encoded 32-byte key.
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
    key_id: Option<String>,
}

impl AesGcmEncryptor {
    pub fn new(encryption_key: &str) -> Result<Self, EncryptionError> {
        let key_bytes = BASE64
            .decode(encryption_key)
            .map_err(|e| EncryptionError::InvalidKey(format!("invalid base64 key: {e}")))?;

        if key_bytes.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKey(format!(
                "key must be {KEY_LEN} bytes, got {}",
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;

        Ok(Self {
            cipher,
            key_id: None,
        })
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Generate a fresh base64-encoded 256-bit key.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }
}

impl MessageEncryptor for AesGcmEncryptor {
    fn encrypt(
        &self,
        plaintext: &[u8],
        ctx: &SecurityContext,
    ) -> Result<EncryptedPayload, EncryptionError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = ctx.associated_data.as_deref().unwrap_or(&[]);
        let mut sealed = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| EncryptionError::EncryptFailed(e.to_string()))?;

        // aes-gcm appends the tag; split it out so it travels explicitly.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedPayload {
            ciphertext: sealed,
            nonce: nonce_bytes.to_vec(),
            tag,
            algorithm: "AES-256-GCM".to_string(),
            key_id: ctx.key_id.clone().or_else(|| self.key_id.clone()),
        })
    }

    fn decrypt(
        &self,
        encrypted: &EncryptedPayload,
        ctx: &SecurityContext,
    ) -> Result<Vec<u8>, EncryptionError> {
        if encrypted.nonce.len() != NONCE_LEN {
            return Err(EncryptionError::Malformed(format!(
                "nonce must be {NONCE_LEN} bytes"
            )));
        }
        if encrypted.tag.len() != TAG_LEN {
            return Err(EncryptionError::Malformed(format!(
                "tag must be {TAG_LEN} bytes"
            )));
        }

        let nonce = Nonce::from_slice(&encrypted.nonce);
        let mut sealed = encrypted.ciphertext.clone();
        sealed.extend_from_slice(&encrypted.tag);

        let aad = ctx.associated_data.as_deref().unwrap_or(&[]);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::TagMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor() -> AesGcmEncryptor {
        AesGcmEncryptor::new(&AesGcmEncryptor::generate_key()).unwrap()
    }

    #[test]
    fn rejects_short_keys() {
        let short = BASE64.encode([0u8; 16]);
        assert!(matches!(
            AesGcmEncryptor::new(&short),
            Err(EncryptionError::InvalidKey(_))
        ));
        assert!(matches!(
            AesGcmEncryptor::new("not base64!!!"),
            Err(EncryptionError::InvalidKey(_))
        ));
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let enc = encryptor();
        let ctx = SecurityContext::default();
        let plaintext = b"the quick brown fox";

        let payload = enc.encrypt(plaintext, &ctx).unwrap();
        assert_eq!(payload.algorithm, "AES-256-GCM");
        assert_eq!(payload.nonce.len(), 12);
        assert_eq!(payload.tag.len(), 16);

        let decrypted = enc.decrypt(&payload, &ctx).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn tampering_any_part_fails_decryption() {
        let enc = encryptor();
        let ctx = SecurityContext::default();
        let payload = enc.encrypt(b"secret", &ctx).unwrap();

        let mut bad = payload.clone();
        bad.ciphertext[0] ^= 0x01;
        assert_eq!(enc.decrypt(&bad, &ctx), Err(EncryptionError::TagMismatch));

        let mut bad = payload.clone();
        bad.nonce[0] ^= 0x01;
        assert_eq!(enc.decrypt(&bad, &ctx), Err(EncryptionError::TagMismatch));

        let mut bad = payload;
        bad.tag[0] ^= 0x01;
        assert_eq!(enc.decrypt(&bad, &ctx), Err(EncryptionError::TagMismatch));
    }

    #[test]
    fn associated_data_is_bound_to_the_tag() {
        let enc = encryptor();
        let ctx = SecurityContext {
            key_id: None,
            associated_data: Some(b"tenant-1".to_vec()),
        };
        let payload = enc.encrypt(b"scoped", &ctx).unwrap();

        assert!(enc.decrypt(&payload, &ctx).is_ok());
        let wrong = SecurityContext {
            key_id: None,
            associated_data: Some(b"tenant-2".to_vec()),
        };
        assert_eq!(
            enc.decrypt(&payload, &wrong),
            Err(EncryptionError::TagMismatch)
        );
    }

    #[test]
    fn wrong_key_fails() {
        let a = encryptor();
        let b = encryptor();
        let ctx = SecurityContext::default();
        let payload = a.encrypt(b"cross", &ctx).unwrap();
        assert_eq!(b.decrypt(&payload, &ctx), Err(EncryptionError::TagMismatch));
    }
}
