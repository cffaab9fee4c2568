//! Maps a verified upstream identity onto the downstream session and finishes
//! the authorize request. Every successful sub-protocol converges here.

use axum::response::Response;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use shared::error::CommonError;

use crate::logic::oauth_error::log_authorize_error;
use crate::logic::provider_engine::{AuthorizeRequest, ProviderEngine};
use crate::logic::upstream::UpstreamOidcIdentityProvider;
use crate::logic::{
    ID_TOKEN_ISSUER_CLAIM, ID_TOKEN_SUBJECT_CLAIM, SCOPE_OFFLINE_ACCESS, SCOPE_OPENID,
    SCOPE_REQUEST_AUDIENCE,
};

/// Subject used when validating a request before any user is known.
pub const PLACEHOLDER_SUBJECT: &str = "none";

const EMAIL_CLAIM: &str = "email";
const EMAIL_VERIFIED_CLAIM: &str = "email_verified";

/// An identity that an upstream has just authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub subject: String,
    pub username: String,
    pub groups: Vec<String>,
}

/// Claims installed into the downstream session before a code is minted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamSession {
    pub subject: String,
    pub username: String,
    pub groups: Vec<String>,
    pub auth_time: DateTime<Utc>,
    pub requested_at: DateTime<Utc>,
}

pub fn make_downstream_session(
    subject: impl Into<String>,
    username: impl Into<String>,
    groups: Vec<String>,
) -> DownstreamSession {
    let now = Utc::now();
    DownstreamSession {
        subject: subject.into(),
        username: username.into(),
        groups,
        auth_time: now,
        requested_at: now,
    }
}

pub fn placeholder_session() -> DownstreamSession {
    make_downstream_session(PLACEHOLDER_SUBJECT, "", vec![])
}

pub fn grant_scopes_if_requested(request: &mut AuthorizeRequest) {
    for scope in [SCOPE_OPENID, SCOPE_OFFLINE_ACCESS, SCOPE_REQUEST_AUDIENCE] {
        if request.scope_was_requested(scope) {
            request.grant_scope(scope);
        }
    }
}

/// Builds the session for `identity`, asks the engine for an authorization
/// response and writes exactly one response: the success redirect or the
/// engine's OAuth2 error.
pub async fn make_downstream_session_and_return_authcode_redirect(
    engine: &dyn ProviderEngine,
    request: &AuthorizeRequest,
    identity: VerifiedIdentity,
) -> Response {
    let session = make_downstream_session(identity.subject, identity.username, identity.groups);

    match engine.new_authorize_response(request, &session).await {
        Ok(response) => engine.write_authorize_response(request, &response),
        Err(err) => {
            log_authorize_error("authorize response error", &err);
            engine.write_authorize_error(Some(request), &err)
        }
    }
}

fn unprocessable(msg: impl Into<String>) -> CommonError {
    CommonError::Unprocessable {
        msg: msg.into(),
        source: None,
    }
}

fn required_string_claim<'a>(claims: &'a Map<String, Value>, name: &str) -> Result<&'a str, CommonError> {
    match claims.get(name) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value),
        Some(_) => Err(unprocessable(format!(
            "required claim in upstream ID token has invalid format: {name}"
        ))),
        None => Err(unprocessable(format!(
            "required claim in upstream ID token missing: {name}"
        ))),
    }
}

/// Derives subject, username and groups from validated upstream ID token
/// claims, using the claim names the upstream is configured with.
pub fn downstream_identity_from_upstream_id_token(
    upstream: &dyn UpstreamOidcIdentityProvider,
    claims: &Map<String, Value>,
) -> Result<VerifiedIdentity, CommonError> {
    let issuer = required_string_claim(claims, ID_TOKEN_ISSUER_CLAIM)?;
    let upstream_subject = required_string_claim(claims, ID_TOKEN_SUBJECT_CLAIM)?;
    let escaped_subject: String =
        url::form_urlencoded::byte_serialize(upstream_subject.as_bytes()).collect();
    let subject = format!("{issuer}?{ID_TOKEN_SUBJECT_CLAIM}={escaped_subject}");

    let username_claim = upstream.username_claim();
    if username_claim == EMAIL_CLAIM {
        match claims.get(EMAIL_VERIFIED_CLAIM) {
            None | Some(Value::Bool(true)) => {}
            Some(Value::Bool(false)) => {
                tracing::warn!(
                    upstream_name = upstream.name(),
                    "username claim is email but the upstream reports it as unverified"
                );
                return Err(unprocessable(format!(
                    "email claim from upstream is not verified: {EMAIL_VERIFIED_CLAIM}=false"
                )));
            }
            Some(_) => {
                return Err(unprocessable(format!(
                    "email_verified claim from upstream has invalid format: {EMAIL_VERIFIED_CLAIM}"
                )));
            }
        }
    }
    let username = required_string_claim(claims, username_claim)?.to_string();

    let groups = match upstream.groups_claim() {
        Some(groups_claim) => groups_from_claim(claims, groups_claim)?,
        None => Vec::new(),
    };

    Ok(VerifiedIdentity {
        subject,
        username,
        groups,
    })
}

fn groups_from_claim(claims: &Map<String, Value>, name: &str) -> Result<Vec<String>, CommonError> {
    match claims.get(name) {
        None => Ok(Vec::new()),
        Some(Value::String(group)) => Ok(vec![group.clone()]),
        Some(Value::Array(values)) => values
            .iter()
            .map(|v| match v {
                Value::String(group) => Ok(group.clone()),
                _ => Err(unprocessable(format!(
                    "groups claim in upstream ID token has invalid format: {name}"
                ))),
            })
            .collect(),
        Some(_) => Err(unprocessable(format!(
            "groups claim in upstream ID token has invalid format: {name}"
        ))),
    }
}
