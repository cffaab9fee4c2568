//! Unguessable single-use values binding one authorization attempt together:
//! the CSRF token, the OIDC nonce and the PKCE verifier.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use oauth2::{PkceCodeChallenge, PkceCodeVerifier};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use shared::error::CommonError;

const RANDOM_VALUE_BYTES: usize = 32;

pub const PKCE_METHOD_S256: &str = "S256";

macro_rules! secret_string_type {
    ($name:ident) => {
        #[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn secret(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "([redacted])"))
            }
        }
    };
}

secret_string_type!(CsrfToken);
secret_string_type!(Nonce);
secret_string_type!(PkceCode);

impl Nonce {
    /// The authorization request parameter carrying this nonce.
    pub fn param(&self) -> (&'static str, &str) {
        ("nonce", self.secret())
    }
}

impl PkceCode {
    /// S256 challenge derived from this verifier.
    pub fn challenge(&self) -> PkceCodeChallenge {
        PkceCodeChallenge::from_code_verifier_sha256(&PkceCodeVerifier::new(self.0.clone()))
    }

    pub fn verifier(&self) -> PkceCodeVerifier {
        PkceCodeVerifier::new(self.0.clone())
    }
}

/// Source of fresh security values. Injected so tests can substitute
/// deterministic or failing generators.
pub trait SecurityValueGenerator: Send + Sync {
    fn generate_csrf(&self) -> Result<CsrfToken, CommonError>;
    fn generate_nonce(&self) -> Result<Nonce, CommonError>;
    fn generate_pkce(&self) -> Result<PkceCode, CommonError>;
}

/// Draws every value from the operating system's CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSecurityValues;

impl SecurityValueGenerator for RandomSecurityValues {
    fn generate_csrf(&self) -> Result<CsrfToken, CommonError> {
        random_url_safe_string().map(CsrfToken)
    }

    fn generate_nonce(&self) -> Result<Nonce, CommonError> {
        random_url_safe_string().map(Nonce)
    }

    fn generate_pkce(&self) -> Result<PkceCode, CommonError> {
        // 32 bytes encode to 43 characters, the minimum verifier length in RFC 7636.
        random_url_safe_string().map(PkceCode)
    }
}

pub(crate) fn random_url_safe_string() -> Result<String, CommonError> {
    let mut bytes = [0u8; RANDOM_VALUE_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CommonError::internal("failed to read random bytes", e))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
