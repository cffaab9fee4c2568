//! The upstream `state` parameter: an authenticated, versioned envelope that
//! carries everything the callback leg needs to resume the downstream
//! authorization without server-side session storage.

use serde::{Deserialize, Serialize};
use shared::error::CommonError;
use thiserror::Error;

use crate::logic::codec::{CodecError, SecureCodec};
use crate::logic::security_values::{CsrfToken, Nonce, PkceCode};

pub const UPSTREAM_STATE_PARAM_ENCODING_NAME: &str = "s";
pub const UPSTREAM_STATE_PARAM_FORMAT_VERSION: &str = "1";

const FORMAT_VERSION_FIELD: &str = "v";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamStateParamData {
    /// Original downstream authorize parameters, form encoded.
    #[serde(rename = "p")]
    pub auth_params: String,
    #[serde(rename = "u")]
    pub upstream_name: String,
    #[serde(rename = "n")]
    pub nonce: Nonce,
    #[serde(rename = "c")]
    pub csrf_token: CsrfToken,
    #[serde(rename = "k")]
    pub pkce_code: PkceCode,
    #[serde(rename = "v")]
    pub format_version: String,
}

#[derive(Debug, Error)]
pub enum StateParamError {
    #[error("error reading state")]
    Decode(#[from] CodecError),
    #[error("state format version is invalid")]
    UnsupportedFormatVersion(Option<String>),
    #[error("state payload is invalid")]
    InvalidPayload(#[source] serde_json::Error),
}

impl From<StateParamError> for CommonError {
    fn from(e: StateParamError) -> Self {
        match e {
            StateParamError::UnsupportedFormatVersion(_) => CommonError::Unprocessable {
                msg: e.to_string(),
                source: None,
            },
            StateParamError::Decode(_) | StateParamError::InvalidPayload(_) => {
                CommonError::InvalidRequest {
                    msg: "error reading state".to_string(),
                    source: Some(e.into()),
                }
            }
        }
    }
}

pub fn encode_upstream_state_param(
    codec: &SecureCodec,
    data: &UpstreamStateParamData,
) -> Result<String, CommonError> {
    codec
        .encode(UPSTREAM_STATE_PARAM_ENCODING_NAME, data)
        .map_err(|e| CommonError::internal("error encoding upstream state param", e))
}

/// Authenticates the envelope, then checks the format version before the rest
/// of the payload is interpreted.
pub fn decode_upstream_state_param(
    codec: &SecureCodec,
    encoded: &str,
) -> Result<UpstreamStateParamData, StateParamError> {
    let raw: serde_json::Value = codec.decode(UPSTREAM_STATE_PARAM_ENCODING_NAME, encoded)?;

    let version = raw
        .get(FORMAT_VERSION_FIELD)
        .and_then(|v| v.as_str())
        .map(str::to_string);
    if version.as_deref() != Some(UPSTREAM_STATE_PARAM_FORMAT_VERSION) {
        return Err(StateParamError::UnsupportedFormatVersion(version));
    }

    serde_json::from_value(raw).map_err(StateParamError::InvalidPayload)
}

#[cfg(test)]
mod unit_test {
    use super::*;
    use crate::logic::codec::CodecKey;

    fn codec() -> SecureCodec {
        SecureCodec::new(vec![CodecKey::generate().unwrap()], None).unwrap()
    }

    fn sample() -> UpstreamStateParamData {
        UpstreamStateParamData {
            auth_params: "client_id=test-client&scope=openid+groups&state=abcdefgh".to_string(),
            upstream_name: "upstream-oidc".to_string(),
            nonce: Nonce::new("test-nonce"),
            csrf_token: CsrfToken::new("test-csrf"),
            pkce_code: PkceCode::new("test-pkce"),
            format_version: UPSTREAM_STATE_PARAM_FORMAT_VERSION.to_string(),
        }
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let codec = codec();
        let data = sample();
        let encoded = encode_upstream_state_param(&codec, &data).unwrap();
        let decoded = decode_upstream_state_param(&codec, &encoded).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded.format_version, "1");
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        let mut keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["c", "k", "n", "p", "u", "v"]);
    }

    #[test]
    fn test_unknown_format_version_is_rejected_before_parsing() {
        let codec = codec();
        // Deliberately not shaped like the current payload.
        let future = serde_json::json!({ "v": "2", "x": ["something", "else"] });
        let encoded = codec
            .encode(UPSTREAM_STATE_PARAM_ENCODING_NAME, &future)
            .unwrap();

        match decode_upstream_state_param(&codec, &encoded) {
            Err(StateParamError::UnsupportedFormatVersion(Some(v))) => assert_eq!(v, "2"),
            other => panic!("expected a version error, got {other:?}"),
        }
    }

    #[test]
    fn test_state_from_another_codec_is_rejected() {
        let encoded = encode_upstream_state_param(&codec(), &sample()).unwrap();
        assert!(matches!(
            decode_upstream_state_param(&codec(), &encoded),
            Err(StateParamError::Decode(CodecError::Unauthenticated))
        ));
    }
}
