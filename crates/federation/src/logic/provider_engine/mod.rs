//! The downstream OAuth2 provider engine: parses and validates authorize
//! requests, mints authorization codes, and writes OAuth2-shaped responses.

mod default;
mod store;

pub use default::{DefaultProviderEngine, DownstreamClient};
pub use store::{
    AuthorizeCodeRecord, AuthorizeCodeStore, DEFAULT_AUTHORIZE_CODE_LIFETIME_SECONDS,
    InMemoryAuthorizeCodeStore,
};

use std::collections::BTreeSet;

use async_trait::async_trait;
use axum::response::Response;
use url::Url;

use crate::logic::downstream_session::DownstreamSession;
use crate::logic::oauth_error::AuthorizeError;

/// Raw authorize parameters in arrival order. Repeated keys are kept so the
/// engine can reject them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizeForm(Vec<(String, String)>);

impl AuthorizeForm {
    pub fn parse(encoded: &str) -> Self {
        Self(
            url::form_urlencoded::parse(encoded.as_bytes())
                .into_owned()
                .collect(),
        )
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn extend(&mut self, other: AuthorizeForm) {
        self.0.extend(other.0);
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn count(&self, key: &str) -> usize {
        self.0.iter().filter(|(k, _)| k == key).count()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    /// Form encoding with keys sorted, so equal forms encode identically.
    pub fn encode(&self) -> String {
        let mut pairs: Vec<_> = self.0.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish()
    }
}

/// A parsed, validated authorize request. Lives for one HTTP request only.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub client_id: String,
    pub redirect_uri: Url,
    pub response_type: String,
    pub requested_scopes: Vec<String>,
    pub granted_scopes: BTreeSet<String>,
    pub state: String,
    pub form: AuthorizeForm,
}

impl AuthorizeRequest {
    pub fn scope_was_requested(&self, scope: &str) -> bool {
        self.requested_scopes.iter().any(|s| s == scope)
    }

    pub fn grant_scope(&mut self, scope: &str) {
        self.granted_scopes.insert(scope.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeResponse {
    pub code: String,
    pub state: String,
    pub granted_scopes: BTreeSet<String>,
}

#[async_trait]
pub trait ProviderEngine: Send + Sync {
    async fn new_authorize_request(
        &self,
        form: &AuthorizeForm,
    ) -> Result<AuthorizeRequest, AuthorizeError>;

    async fn new_authorize_response(
        &self,
        request: &AuthorizeRequest,
        session: &DownstreamSession,
    ) -> Result<AuthorizeResponse, AuthorizeError>;

    fn write_authorize_error(
        &self,
        request: Option<&AuthorizeRequest>,
        err: &AuthorizeError,
    ) -> Response;

    fn write_authorize_response(
        &self,
        request: &AuthorizeRequest,
        response: &AuthorizeResponse,
    ) -> Response;
}
