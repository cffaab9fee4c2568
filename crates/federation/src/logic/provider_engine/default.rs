use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use http::{StatusCode, header};
use serde::Deserialize;
use url::Url;

use crate::logic::downstream_session::DownstreamSession;
use crate::logic::oauth_error::{AuthorizeError, AuthorizeErrorKind};
use crate::logic::provider_engine::{
    AuthorizeCodeRecord, AuthorizeCodeStore, AuthorizeForm, AuthorizeRequest, AuthorizeResponse,
    ProviderEngine,
};
use crate::logic::security_values::{PKCE_METHOD_S256, random_url_safe_string};

const MIN_STATE_LENGTH: usize = 8;
const MIN_NONCE_LENGTH: usize = 8;
const RESPONSE_TYPE_CODE: &str = "code";
const PROMPT_NONE: &str = "none";

/// Parameters that must not be repeated in one request.
const SINGLE_VALUED_PARAMS: [&str; 9] = [
    "client_id",
    "redirect_uri",
    "response_type",
    "scope",
    "state",
    "nonce",
    "prompt",
    "code_challenge",
    "code_challenge_method",
];

fn default_allowed_scopes() -> Vec<String> {
    [
        "openid",
        "offline_access",
        "profile",
        "email",
        "groups",
        "username",
        "fedgate:request-audience",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_require_pkce() -> bool {
    true
}

/// A registered downstream OAuth2 client.
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamClient {
    pub client_id: String,
    /// Compared byte for byte with the request's `redirect_uri`.
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_allowed_scopes")]
    pub allowed_scopes: Vec<String>,
    #[serde(default = "default_require_pkce")]
    pub require_pkce: bool,
}

/// Provider engine for statically configured clients. The instance without a
/// code store validates requests and builds responses without recording
/// anything, which is what pre-validation before an upstream redirect needs.
#[derive(Clone)]
pub struct DefaultProviderEngine {
    clients: Arc<HashMap<String, DownstreamClient>>,
    store: Option<Arc<dyn AuthorizeCodeStore>>,
}

impl DefaultProviderEngine {
    pub fn new(clients: Vec<DownstreamClient>, store: Arc<dyn AuthorizeCodeStore>) -> Self {
        Self {
            clients: Arc::new(
                clients
                    .into_iter()
                    .map(|c| (c.client_id.clone(), c))
                    .collect(),
            ),
            store: Some(store),
        }
    }

    pub fn without_storage(&self) -> Self {
        Self {
            clients: self.clients.clone(),
            store: None,
        }
    }

    fn validate_redirect_uri(
        client: &DownstreamClient,
        requested: Option<&str>,
    ) -> Result<Url, AuthorizeError> {
        let redirect_uri = match (requested, client.redirect_uris.as_slice()) {
            (Some(requested), registered) => registered
                .iter()
                .find(|uri| uri.as_str() == requested)
                .ok_or_else(|| {
                    AuthorizeError::invalid_request().with_hint(
                        "The 'redirect_uri' parameter does not match any of the OAuth 2.0 Client's pre-registered redirect urls.",
                    )
                })?,
            (None, [only]) => only,
            (None, _) => {
                return Err(AuthorizeError::invalid_request()
                    .with_hint("The 'redirect_uri' parameter is required."));
            }
        };

        Url::parse(redirect_uri).map_err(|e| {
            AuthorizeError::invalid_request()
                .with_hint("The 'redirect_uri' parameter is malformed.")
                .with_debug(e.to_string())
        })
    }
}

#[async_trait]
impl ProviderEngine for DefaultProviderEngine {
    async fn new_authorize_request(
        &self,
        form: &AuthorizeForm,
    ) -> Result<AuthorizeRequest, AuthorizeError> {
        if let Some(repeated) = SINGLE_VALUED_PARAMS.iter().find(|p| form.count(p) > 1) {
            return Err(AuthorizeError::invalid_request().with_hint(format!(
                "The '{repeated}' parameter was included more than once."
            )));
        }

        let client_id = form.get("client_id").unwrap_or_default();
        let client = self.clients.get(client_id).ok_or_else(|| {
            AuthorizeError::new(AuthorizeErrorKind::InvalidClient)
                .with_hint("The requested OAuth 2.0 Client does not exist.")
        })?;

        let redirect_uri = Self::validate_redirect_uri(client, form.get("redirect_uri"))?;

        let response_type = form.get("response_type").unwrap_or_default();
        if response_type != RESPONSE_TYPE_CODE {
            return Err(
                AuthorizeError::new(AuthorizeErrorKind::UnsupportedResponseType).with_hint(
                    format!("The client is not allowed to request response_type '{response_type}'."),
                ),
            );
        }

        let requested_scopes: Vec<String> = form
            .get("scope")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if let Some(scope) = requested_scopes
            .iter()
            .find(|s| !client.allowed_scopes.contains(s))
        {
            return Err(AuthorizeError::new(AuthorizeErrorKind::InvalidScope)
                .with_hint(format!("The OAuth 2.0 Client is not allowed to request scope '{scope}'.")));
        }

        let state = form.get("state").unwrap_or_default();
        if state.len() < MIN_STATE_LENGTH {
            return Err(AuthorizeError::new(AuthorizeErrorKind::InvalidState).with_hint(format!(
                "Request parameter 'state' must be at least be {MIN_STATE_LENGTH} characters long to ensure sufficient entropy."
            )));
        }

        match (form.get("code_challenge"), form.get("code_challenge_method")) {
            (None, _) if client.require_pkce => {
                return Err(AuthorizeError::invalid_request().with_hint(
                    "Clients must include a code_challenge when performing the authorize code flow, but it is missing.",
                ));
            }
            (Some(_), method) if method != Some(PKCE_METHOD_S256) => {
                return Err(AuthorizeError::invalid_request().with_hint(
                    "Clients must use code_challenge_method=S256, plain is not allowed.",
                ));
            }
            _ => {}
        }

        Ok(AuthorizeRequest {
            client_id: client.client_id.clone(),
            redirect_uri,
            response_type: response_type.to_string(),
            requested_scopes,
            granted_scopes: BTreeSet::new(),
            state: state.to_string(),
            form: form.clone(),
        })
    }

    async fn new_authorize_response(
        &self,
        request: &AuthorizeRequest,
        session: &DownstreamSession,
    ) -> Result<AuthorizeResponse, AuthorizeError> {
        if session.subject.is_empty() {
            return Err(AuthorizeError::server_error()
                .with_debug("the downstream session is missing a subject"));
        }

        let nonce = request.form.get("nonce");
        if nonce.is_some_and(|n| n.len() < MIN_NONCE_LENGTH) {
            return Err(AuthorizeError::invalid_request().with_hint(format!(
                "Parameter 'nonce' is set but does not satisfy the minimum entropy of {MIN_NONCE_LENGTH} characters."
            )));
        }

        let prompts: Vec<&str> = request
            .form
            .get("prompt")
            .unwrap_or_default()
            .split_whitespace()
            .collect();
        if prompts.contains(&PROMPT_NONE) && prompts.len() > 1 {
            return Err(AuthorizeError::invalid_request().with_hint(
                "Parameter 'prompt' was set to 'none', but contains other values as well which is not allowed.",
            ));
        }

        let code = random_url_safe_string().map_err(|e| {
            AuthorizeError::server_error().with_debug(shared::error::error_chain(&e))
        })?;

        if let Some(store) = &self.store {
            let record = AuthorizeCodeRecord {
                client_id: request.client_id.clone(),
                redirect_uri: request.redirect_uri.clone(),
                granted_scopes: request.granted_scopes.clone(),
                session: session.clone(),
                code_challenge: request.form.get("code_challenge").map(str::to_string),
                code_challenge_method: request
                    .form
                    .get("code_challenge_method")
                    .map(str::to_string),
                nonce: nonce.map(str::to_string),
                created_at: Utc::now(),
            };
            store
                .create_authorize_code_session(&code, record)
                .await
                .map_err(|e| {
                    AuthorizeError::server_error().with_debug(shared::error::error_chain(&e))
                })?;
        }

        Ok(AuthorizeResponse {
            code,
            state: request.state.clone(),
            granted_scopes: request.granted_scopes.clone(),
        })
    }

    fn write_authorize_error(
        &self,
        request: Option<&AuthorizeRequest>,
        err: &AuthorizeError,
    ) -> Response {
        let body = err.to_response_body(request.map(|r| r.state.as_str()));
        (err.kind().status_code(), Json(body)).into_response()
    }

    fn write_authorize_response(
        &self,
        request: &AuthorizeRequest,
        response: &AuthorizeResponse,
    ) -> Response {
        let mut location = request.redirect_uri.clone();
        {
            let granted: Vec<&str> = response.granted_scopes.iter().map(String::as_str).collect();
            let mut query = location.query_pairs_mut();
            query.append_pair("code", &response.code);
            query.append_pair("scope", &granted.join(" "));
            query.append_pair("state", &response.state);
        }
        (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
    }
}
