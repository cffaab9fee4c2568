use std::io::Write;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::response::Response;
use axum_extra::extract::cookie::Cookie;
use http::{Request, header};
use serde_json::Value;
use tower::ServiceExt;
use tracing_subscriber::fmt::MakeWriter;
use url::Url;

use crate::logic::codec::{CodecKey, SecureCodec};
use crate::logic::csrf_cookie::{CSRF_COOKIE_NAME, csrf_cookie};
use crate::logic::provider_engine::{
    DefaultProviderEngine, DownstreamClient, InMemoryAuthorizeCodeStore,
};
use crate::logic::security_values::{CsrfToken, SecurityValueGenerator};
use crate::logic::upstream::{
    DynamicUpstreamIdpProvider, SingleUpstreamPolicy, UpstreamLdapIdentityProvider,
    UpstreamOidcIdentityProvider,
};
use crate::router::{AUTHORIZE_PATH, CALLBACK_PATH, create_router};
use crate::service::{FederationService, FederationServiceParams};
use crate::test::fakes::FixedSecurityValues;

pub const TEST_ISSUER: &str = "https://fed.example.com/issuer";
pub const TEST_CLIENT_ID: &str = "test-client";
pub const TEST_REDIRECT_URI: &str = "http://127.0.0.1/callback";
pub const TEST_DOWNSTREAM_STATE: &str = "downstream-state-value";
pub const TEST_DOWNSTREAM_NONCE: &str = "downstream-nonce-value";
pub const TEST_CODE_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

/// A federation service with one downstream client, no upstreams and fixed
/// security values. Upstreams are added through the dynamic registry.
pub struct TestContext {
    pub service: FederationService,
    pub upstreams: Arc<DynamicUpstreamIdpProvider>,
    pub store: InMemoryAuthorizeCodeStore,
}

impl TestContext {
    pub fn new() -> Self {
        shared::setup_test!();

        let store = InMemoryAuthorizeCodeStore::new();
        let engine = DefaultProviderEngine::new(
            vec![DownstreamClient {
                client_id: TEST_CLIENT_ID.to_string(),
                redirect_uris: vec![TEST_REDIRECT_URI.to_string()],
                allowed_scopes: ["openid", "offline_access", "groups", "username", "email"]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                require_pkce: true,
            }],
            Arc::new(store.clone()),
        );
        let upstreams = Arc::new(DynamicUpstreamIdpProvider::new());

        let service = FederationService::new(FederationServiceParams {
            issuer: Url::parse(TEST_ISSUER).expect("Failed to parse test issuer"),
            upstreams: upstreams.clone(),
            selection_policy: Arc::new(SingleUpstreamPolicy),
            validation_engine: Arc::new(engine.without_storage()),
            engine: Arc::new(engine),
            security_values: Arc::new(FixedSecurityValues),
            state_codec: test_codec(),
            cookie_codec: test_codec(),
        })
        .expect("Failed to create federation service");

        Self {
            service,
            upstreams,
            store,
        }
    }

    pub fn with_oidc_upstreams(self, oidc: Vec<Arc<dyn UpstreamOidcIdentityProvider>>) -> Self {
        self.upstreams.set_oidc_identity_providers(oidc);
        self
    }

    pub fn with_ldap_upstreams(self, ldap: Vec<Arc<dyn UpstreamLdapIdentityProvider>>) -> Self {
        self.upstreams.set_ldap_identity_providers(ldap);
        self
    }

    pub fn with_security_values(mut self, values: Arc<dyn SecurityValueGenerator>) -> Self {
        self.service.security_values = values;
        self
    }

    pub fn router(&self) -> Router {
        create_router(self.service.clone())
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router()
            .oneshot(request)
            .await
            .expect("Router is infallible")
    }

    pub fn authorize_path(&self) -> String {
        format!("{}{AUTHORIZE_PATH}", self.service.issuer_path())
    }

    pub fn callback_path(&self) -> String {
        format!("{}{CALLBACK_PATH}", self.service.issuer_path())
    }

    /// `Cookie` header value carrying a valid CSRF cookie for `csrf`.
    pub fn csrf_cookie_header(&self, csrf: &str) -> String {
        let cookie = csrf_cookie(&CsrfToken::new(csrf), &self.service.cookie_codec)
            .expect("Failed to encode CSRF cookie");
        format!("{}={}", cookie.name(), cookie.value())
    }
}

pub fn test_codec() -> SecureCodec {
    SecureCodec::new(
        vec![CodecKey::generate().expect("Failed to generate key")],
        None,
    )
    .expect("Failed to create codec")
}

/// A valid downstream authorize request, with `overrides` replacing (or with
/// `None` removing) individual parameters.
pub fn authorize_params(overrides: &[(&str, Option<&str>)]) -> Vec<(String, String)> {
    let defaults = [
        ("client_id", TEST_CLIENT_ID),
        ("redirect_uri", TEST_REDIRECT_URI),
        ("response_type", "code"),
        ("scope", "openid offline_access groups"),
        ("state", TEST_DOWNSTREAM_STATE),
        ("nonce", TEST_DOWNSTREAM_NONCE),
        ("code_challenge", TEST_CODE_CHALLENGE),
        ("code_challenge_method", "S256"),
    ];

    let mut params: Vec<(String, String)> = defaults
        .iter()
        .filter(|(k, _)| !overrides.iter().any(|(o, _)| o == k))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    params.extend(
        overrides
            .iter()
            .filter_map(|(k, v)| v.map(|v| (k.to_string(), v.to_string()))),
    );
    params
}

pub fn form_encode(params: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}

pub fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

pub fn location(response: &Response) -> Url {
    let location = response
        .headers()
        .get(header::LOCATION)
        .expect("Response has no Location header")
        .to_str()
        .expect("Location header is not ASCII");
    Url::parse(location).expect("Location header is not a URL")
}

pub fn csrf_set_cookie(response: &Response) -> Option<Cookie<'static>> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| Cookie::parse(v.to_string()).ok())
        .find(|c| c.name() == CSRF_COOKIE_NAME)
}

pub async fn body_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    serde_json::from_slice(&body).expect("Response body is not JSON")
}

/// Log output written while a [`CapturedLogs::subscriber`] is the default.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
