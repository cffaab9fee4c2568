//! The authorization endpoint: validates the method, picks the upstream and
//! drives one of three federation sub-protocols.
//!
//! 1. LDAP direct bind (username/password headers, LDAP upstream)
//! 2. OIDC password grant (username/password headers, OIDC upstream)
//! 3. OIDC authorization code (browser redirect to the OIDC upstream)

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use http::{HeaderMap, Method, StatusCode, header};
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken as OAuthState, RedirectUrl, Scope};
use shared::error::{CommonError, error_chain};
use url::Url;

use crate::logic::csrf_cookie::{csrf_cookie, read_csrf_cookie};
use crate::logic::downstream_session::{
    VerifiedIdentity, downstream_identity_from_upstream_id_token, grant_scopes_if_requested,
    make_downstream_session_and_return_authcode_redirect, placeholder_session,
};
use crate::logic::oauth_error::{AuthorizeError, log_authorize_error};
use crate::logic::provider_engine::{AuthorizeForm, AuthorizeRequest, ProviderEngine};
use crate::logic::security_values::{CsrfToken, Nonce, PkceCode, SecurityValueGenerator};
use crate::logic::state_param::{
    UPSTREAM_STATE_PARAM_FORMAT_VERSION, UpstreamStateParamData, encode_upstream_state_param,
};
use crate::logic::upstream::{
    SelectedUpstream, UpstreamLdapIdentityProvider, UpstreamOidcIdentityProvider,
};
use crate::logic::{AUTHORIZE_PASSWORD_HEADER_NAME, AUTHORIZE_USERNAME_HEADER_NAME, SCOPE_OPENID};
use crate::service::FederationService;

pub const ALLOWED_AUTHORIZE_METHODS: &str = "GET, POST";

const LDAP_SUBJECT_QUERY_PARAM: &str = "sub";

const HINT_MISSING_CREDENTIALS: &str = "Missing or blank username or password.";
const HINT_LDAP_CREDENTIALS_REJECTED: &str = "Username/password not accepted by LDAP provider.";
const HINT_PASSWORD_GRANT_NOT_ALLOWED: &str = "Resource owner password credentials grant is not allowed for this upstream provider according to its configuration.";

/// Handles one authorize request and returns exactly one response.
/// Transport-shaped failures are returned as `Err`; OAuth2-shaped failures are
/// already written by the provider engine and come back as `Ok`.
pub async fn handle_authorize(
    service: &FederationService,
    method: &Method,
    headers: &HeaderMap,
    form: AuthorizeForm,
) -> Result<Response, CommonError> {
    if *method != Method::GET && *method != Method::POST {
        return Err(CommonError::MethodNotAllowed {
            msg: format!("{method} (try GET or POST)"),
            allowed: ALLOWED_AUTHORIZE_METHODS,
        });
    }

    let upstreams = service.upstreams.snapshot();
    let upstream = service.selection_policy.choose_upstream(&upstreams, &form)?;

    match upstream {
        SelectedUpstream::Oidc(oidc) if headers.contains_key(AUTHORIZE_USERNAME_HEADER_NAME) => {
            handle_authorize_with_oidc_password_grant(service, oidc, headers, form).await
        }
        SelectedUpstream::Oidc(oidc) => {
            let jar = CookieJar::from_headers(headers);
            handle_authorize_with_oidc_authcode_grant(service, oidc, jar, form).await
        }
        SelectedUpstream::Ldap(ldap) => handle_authorize_with_ldap(service, ldap, headers, form).await,
    }
}

/// Parses the request through `engine` and grants the special scopes. On
/// failure the engine's error response is returned instead.
async fn new_authorize_request(
    engine: &dyn ProviderEngine,
    form: &AuthorizeForm,
) -> Result<AuthorizeRequest, Response> {
    match engine.new_authorize_request(form).await {
        Ok(mut request) => {
            grant_scopes_if_requested(&mut request);
            Ok(request)
        }
        Err(err) => {
            log_authorize_error("authorize request error", &err);
            Err(engine.write_authorize_error(None, &err))
        }
    }
}

fn write_authorize_error(
    engine: &dyn ProviderEngine,
    request: &AuthorizeRequest,
    err: AuthorizeError,
) -> Response {
    log_authorize_error("authorize response error", &err);
    engine.write_authorize_error(Some(request), &err)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn require_non_empty_credentials(headers: &HeaderMap) -> Option<(&str, &str)> {
    let username = header_value(headers, AUTHORIZE_USERNAME_HEADER_NAME);
    let password = header_value(headers, AUTHORIZE_PASSWORD_HEADER_NAME);
    if username.is_empty() || password.is_empty() {
        return None;
    }
    Some((username, password))
}

// ============================================
// LDAP direct bind
// ============================================

/// Downstream subject for an LDAP user: the upstream URL with `sub=<uid>`
/// added, query keys sorted.
pub fn downstream_subject_from_upstream_ldap(upstream_url: &Url, uid: &str) -> String {
    let mut pairs: Vec<(String, String)> = upstream_url
        .query_pairs()
        .into_owned()
        .filter(|(k, _)| k != LDAP_SUBJECT_QUERY_PARAM)
        .collect();
    pairs.push((LDAP_SUBJECT_QUERY_PARAM.to_string(), uid.to_string()));
    pairs.sort();

    let mut subject = upstream_url.clone();
    subject.set_query(None);
    subject.query_pairs_mut().extend_pairs(pairs);
    subject.to_string()
}

async fn handle_authorize_with_ldap(
    service: &FederationService,
    upstream: Arc<dyn UpstreamLdapIdentityProvider>,
    headers: &HeaderMap,
    form: AuthorizeForm,
) -> Result<Response, CommonError> {
    let engine = service.engine.as_ref();
    let request = match new_authorize_request(engine, &form).await {
        Ok(request) => request,
        Err(response) => return Ok(response),
    };

    let Some((username, password)) = require_non_empty_credentials(headers) else {
        let err = AuthorizeError::access_denied().with_hint(HINT_MISSING_CREDENTIALS);
        return Ok(write_authorize_error(engine, &request, err));
    };

    let user = match upstream.authenticate_user(username, password).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::debug!(
                upstream_name = upstream.name(),
                "failed upstream LDAP authentication"
            );
            let err = AuthorizeError::access_denied().with_hint(HINT_LDAP_CREDENTIALS_REJECTED);
            return Ok(write_authorize_error(engine, &request, err));
        }
        Err(e) => {
            tracing::warn!(
                upstream_name = upstream.name(),
                error = %error_chain(&e),
                "unexpected error during upstream LDAP authentication"
            );
            return Err(CommonError::BadGateway {
                msg: "unexpected error during upstream authentication".to_string(),
                source: Some(e.into()),
            });
        }
    };

    let identity = VerifiedIdentity {
        subject: downstream_subject_from_upstream_ldap(upstream.url(), &user.uid),
        username: user.name,
        groups: user.groups,
    };
    Ok(make_downstream_session_and_return_authcode_redirect(engine, &request, identity).await)
}

// ============================================
// OIDC password grant
// ============================================

async fn handle_authorize_with_oidc_password_grant(
    service: &FederationService,
    upstream: Arc<dyn UpstreamOidcIdentityProvider>,
    headers: &HeaderMap,
    form: AuthorizeForm,
) -> Result<Response, CommonError> {
    let engine = service.engine.as_ref();
    let request = match new_authorize_request(engine, &form).await {
        Ok(request) => request,
        Err(response) => return Ok(response),
    };

    let Some((username, password)) = require_non_empty_credentials(headers) else {
        let err = AuthorizeError::access_denied().with_hint(HINT_MISSING_CREDENTIALS);
        return Ok(write_authorize_error(engine, &request, err));
    };

    if !upstream.allows_password_grant() {
        let err = AuthorizeError::access_denied().with_hint(HINT_PASSWORD_GRANT_NOT_ALLOWED);
        return Ok(write_authorize_error(engine, &request, err));
    }

    // Upstreams disagree on how they reject bad resource owner credentials,
    // so every failure is reported as the same access_denied.
    let tokens = match upstream
        .password_credentials_grant_and_validate_tokens(username, password)
        .await
    {
        Ok(tokens) => tokens,
        Err(e) => {
            let err = AuthorizeError::access_denied().with_debug(error_chain(&e));
            return Ok(write_authorize_error(engine, &request, err));
        }
    };

    let identity =
        downstream_identity_from_upstream_id_token(upstream.as_ref(), &tokens.id_token_claims)?;
    Ok(make_downstream_session_and_return_authcode_redirect(engine, &request, identity).await)
}

// ============================================
// OIDC authorization code
// ============================================

fn generate_values(
    generator: &dyn SecurityValueGenerator,
) -> Result<(CsrfToken, Nonce, PkceCode), CommonError> {
    let csrf = generator
        .generate_csrf()
        .map_err(|e| CommonError::internal("error generating CSRF token", e))?;
    let nonce = generator
        .generate_nonce()
        .map_err(|e| CommonError::internal("error generating nonce param", e))?;
    let pkce = generator
        .generate_pkce()
        .map_err(|e| CommonError::internal("error generating PKCE param", e))?;
    Ok((csrf, nonce, pkce))
}

async fn handle_authorize_with_oidc_authcode_grant(
    service: &FederationService,
    upstream: Arc<dyn UpstreamOidcIdentityProvider>,
    jar: CookieJar,
    form: AuthorizeForm,
) -> Result<Response, CommonError> {
    // Validation only; nothing is stored until the callback leg.
    let engine = service.validation_engine.as_ref();
    let request = match new_authorize_request(engine, &form).await {
        Ok(request) => request,
        Err(response) => return Ok(response),
    };
    if let Err(err) = engine
        .new_authorize_response(&request, &placeholder_session())
        .await
    {
        return Ok(write_authorize_error(engine, &request, err));
    }

    let (generated_csrf, nonce, pkce) = generate_values(service.security_values.as_ref())?;
    let csrf_from_cookie = read_csrf_cookie(&jar, &service.cookie_codec);
    let csrf = csrf_from_cookie.clone().unwrap_or(generated_csrf);

    let client = BasicClient::new(ClientId::new(upstream.client_id().to_string()))
        .set_auth_uri(AuthUrl::from_url(upstream.authorization_url().clone()))
        .set_redirect_uri(RedirectUrl::from_url(service.callback_url.clone()));

    let encoded_state = encode_upstream_state_param(
        &service.state_codec,
        &UpstreamStateParamData {
            auth_params: form.encode(),
            upstream_name: upstream.name().to_string(),
            nonce: nonce.clone(),
            csrf_token: csrf.clone(),
            pkce_code: pkce.clone(),
            format_version: UPSTREAM_STATE_PARAM_FORMAT_VERSION.to_string(),
        },
    )?;

    let jar = match csrf_from_cookie {
        Some(_) => jar,
        None => jar.add(csrf_cookie(&csrf, &service.cookie_codec)?),
    };

    let (nonce_param, nonce_value) = nonce.param();
    let mut auth_request = client
        .authorize_url(move || OAuthState::new(encoded_state))
        .add_scopes(upstream.scopes().iter().cloned().map(Scope::new))
        .set_pkce_challenge(pkce.challenge())
        .add_extra_param("access_type", "offline")
        .add_extra_param(nonce_param, nonce_value);
    if request.scope_was_requested(SCOPE_OPENID) {
        if let Some(prompt) = form.get("prompt").filter(|p| !p.is_empty()) {
            auth_request = auth_request.add_extra_param("prompt", prompt);
        }
    }
    let (upstream_url, _) = auth_request.url();

    Ok((
        StatusCode::FOUND,
        jar,
        [(header::LOCATION, upstream_url.to_string())],
    )
        .into_response())
}
