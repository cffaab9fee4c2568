//! Authenticated encryption of small named payloads carried by the user agent
//! (the upstream `state` parameter and the CSRF cookie).
//!
//! Wire format: `base64url( nonce[12] || AES-256-GCM(json{iat, v}) )` with the
//! encoding name bound as associated data, so a value encoded under one name
//! never decodes under another.

use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use shared::error::CommonError;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// Tolerated clock skew for payloads stamped slightly in the future.
const MAX_CLOCK_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec requires at least one key")]
    NoKeys,
    #[error("invalid key: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid base64 key material")]
    InvalidKeyEncoding(#[source] base64::DecodeError),
    #[error("encoded value is malformed")]
    Malformed,
    #[error("encoded value could not be authenticated with any configured key")]
    Unauthenticated,
    #[error("encoded value has expired")]
    Expired,
    #[error("encryption failed")]
    Encryption,
    #[error("payload serialization failed")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to read random bytes")]
    Random(#[source] rand::Error),
}

impl From<CodecError> for CommonError {
    fn from(e: CodecError) -> Self {
        CommonError::internal("codec error", e)
    }
}

/// One AES-256 key. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CodecKey(Vec<u8>);

impl CodecKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CodecError> {
        if bytes.len() != KEY_LEN {
            return Err(CodecError::InvalidKeyLength(bytes.len()));
        }
        Ok(Self(bytes))
    }

    /// Parses standard base64 key material, as written by `fedgate generate-key`.
    pub fn from_base64(encoded: &str) -> Result<Self, CodecError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(CodecError::InvalidKeyEncoding)?;
        Self::new(bytes)
    }

    pub fn generate() -> Result<Self, CodecError> {
        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.try_fill_bytes(&mut bytes).map_err(CodecError::Random)?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for CodecKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CodecKey([redacted])")
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    iat: i64,
    v: T,
}

/// Encodes with the first key and decodes with any of them, so keys can be
/// rotated by prepending a new key and later dropping the old one.
#[derive(Clone, Debug)]
pub struct SecureCodec {
    keys: Arc<Vec<CodecKey>>,
    max_age: Option<Duration>,
}

impl SecureCodec {
    pub fn new(keys: Vec<CodecKey>, max_age: Option<Duration>) -> Result<Self, CodecError> {
        if keys.is_empty() {
            return Err(CodecError::NoKeys);
        }
        Ok(Self {
            keys: Arc::new(keys),
            max_age,
        })
    }

    pub fn encode<T: Serialize>(&self, name: &str, value: &T) -> Result<String, CodecError> {
        let plaintext = serde_json::to_vec(&Envelope {
            iat: Utc::now().timestamp(),
            v: value,
        })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(CodecError::Random)?;

        let ciphertext = self.keys[0]
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| CodecError::Encryption)?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(result))
    }

    pub fn decode<T: DeserializeOwned>(&self, name: &str, encoded: &str) -> Result<T, CodecError> {
        let data = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| CodecError::Malformed)?;
        if data.len() <= NONCE_LEN {
            return Err(CodecError::Malformed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .keys
            .iter()
            .find_map(|key| {
                key.cipher()
                    .decrypt(
                        nonce,
                        Payload {
                            msg: ciphertext,
                            aad: name.as_bytes(),
                        },
                    )
                    .ok()
            })
            .ok_or(CodecError::Unauthenticated)?;

        let envelope: Envelope<T> = serde_json::from_slice(&plaintext)?;

        let age = Utc::now().timestamp() - envelope.iat;
        if age < -MAX_CLOCK_SKEW_SECONDS {
            return Err(CodecError::Expired);
        }
        if let Some(max_age) = self.max_age {
            if age > max_age.num_seconds() {
                return Err(CodecError::Expired);
            }
        }

        Ok(envelope.v)
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;

    fn codec() -> SecureCodec {
        SecureCodec::new(vec![CodecKey::generate().unwrap()], None).unwrap()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let codec = codec();
        let encoded = codec.encode("csrf", &"some-value".to_string()).unwrap();
        let decoded: String = codec.decode("csrf", &encoded).unwrap();
        assert_eq!(decoded, "some-value");
    }

    #[test]
    fn test_decode_rejects_other_encoding_name() {
        let codec = codec();
        let encoded = codec.encode("csrf", &"some-value".to_string()).unwrap();
        let result = codec.decode::<String>("s", &encoded);
        assert!(matches!(result, Err(CodecError::Unauthenticated)));
    }

    #[test]
    fn test_decode_rejects_tampered_value() {
        let codec = codec();
        let encoded = codec.encode("csrf", &"some-value".to_string()).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(bytes);

        assert!(matches!(
            codec.decode::<String>("csrf", &tampered),
            Err(CodecError::Unauthenticated)
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = codec();
        assert!(matches!(
            codec.decode::<String>("csrf", "not base64 !!"),
            Err(CodecError::Malformed)
        ));
        assert!(matches!(
            codec.decode::<String>("csrf", "AAAA"),
            Err(CodecError::Malformed)
        ));
    }

    #[test]
    fn test_rotated_keys_still_decode() {
        let old_key = CodecKey::generate().unwrap();
        let new_key = CodecKey::generate().unwrap();

        let old_codec = SecureCodec::new(vec![old_key.clone()], None).unwrap();
        let encoded = old_codec.encode("csrf", &"v".to_string()).unwrap();

        let rotated = SecureCodec::new(vec![new_key.clone(), old_key], None).unwrap();
        assert_eq!(rotated.decode::<String>("csrf", &encoded).unwrap(), "v");

        let retired = SecureCodec::new(vec![new_key], None).unwrap();
        assert!(matches!(
            retired.decode::<String>("csrf", &encoded),
            Err(CodecError::Unauthenticated)
        ));
    }

    #[test]
    fn test_expired_values_are_rejected() {
        let codec = SecureCodec::new(
            vec![CodecKey::generate().unwrap()],
            Some(Duration::seconds(-1)),
        )
        .unwrap();
        let encoded = codec.encode("s", &1u32).unwrap();
        assert!(matches!(
            codec.decode::<u32>("s", &encoded),
            Err(CodecError::Expired)
        ));
    }

    #[test]
    fn test_key_validation() {
        assert!(matches!(
            CodecKey::new(vec![0u8; 16]),
            Err(CodecError::InvalidKeyLength(16))
        ));
        assert!(matches!(
            SecureCodec::new(vec![], None),
            Err(CodecError::NoKeys)
        ));

        let key = CodecKey::generate().unwrap();
        let parsed = CodecKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(parsed.to_base64(), key.to_base64());
        assert_eq!(format!("{key:?}"), "CodecKey([redacted])");
    }
}
