//! Message signing: HMAC-SHA256 with constant-time verification.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::encryption::SecurityContext;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// A detached signature over a byte payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Signing contract. The byte-slice API is allocation-free on the verify
/// path: signatures are computed into a fixed-size buffer and compared in
/// constant time.
pub trait MessageSigner: Send + Sync {
    fn sign(&self, data: &[u8], ctx: &SecurityContext) -> Signature;

    fn verify(&self, data: &[u8], signature: &Signature, ctx: &SecurityContext) -> bool;
}

/// HMAC-SHA256 signer.
pub struct HmacSigner {
    key: Vec<u8>,
    key_id: Option<String>,
}

impl HmacSigner {
    pub fn new(signing_secret: &str) -> Result<Self, SigningError> {
        if signing_secret.is_empty() {
            return Err(SigningError::InvalidKey("signing secret is empty".into()));
        }
        Ok(Self {
            key: signing_secret.as_bytes().to_vec(),
            key_id: None,
        })
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any size")
    }

    fn compute(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = self.mac();
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

impl MessageSigner for HmacSigner {
    fn sign(&self, data: &[u8], ctx: &SecurityContext) -> Signature {
        Signature {
            bytes: self.compute(data).to_vec(),
            algorithm: "HMAC-SHA256".to_string(),
            key_id: ctx.key_id.clone().or_else(|| self.key_id.clone()),
            timestamp: Utc::now(),
        }
    }

    fn verify(&self, data: &[u8], signature: &Signature, _ctx: &SecurityContext) -> bool {
        let expected = self.compute(data);
        if signature.bytes.len() != expected.len() {
            return false;
        }
        expected.ct_eq(signature.bytes.as_slice()).into()
    }
}
