//! The callback leg of the authorization-code flow. Runs as an independent
//! request and rebuilds its context from the `state` envelope and the CSRF
//! cookie only.

use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use http::{HeaderMap, Method};
use shared::error::{CommonError, error_chain};
use subtle::ConstantTimeEq;

use crate::logic::csrf_cookie::read_csrf_cookie;
use crate::logic::downstream_session::{
    downstream_identity_from_upstream_id_token, grant_scopes_if_requested,
    make_downstream_session_and_return_authcode_redirect,
};
use crate::logic::oauth_error::log_authorize_error;
use crate::logic::provider_engine::AuthorizeForm;
use crate::logic::state_param::decode_upstream_state_param;
use crate::service::FederationService;

pub const ALLOWED_CALLBACK_METHODS: &str = "GET";

fn invalid_request(msg: &str) -> CommonError {
    CommonError::InvalidRequest {
        msg: msg.to_string(),
        source: None,
    }
}

pub async fn handle_callback(
    service: &FederationService,
    method: &Method,
    headers: &HeaderMap,
    query: AuthorizeForm,
) -> Result<Response, CommonError> {
    if *method != Method::GET {
        return Err(CommonError::MethodNotAllowed {
            msg: format!("{method} (try GET)"),
            allowed: ALLOWED_CALLBACK_METHODS,
        });
    }

    let jar = CookieJar::from_headers(headers);
    let csrf_from_cookie =
        read_csrf_cookie(&jar, &service.cookie_codec).ok_or_else(|| CommonError::Forbidden {
            msg: "CSRF cookie is missing or invalid".to_string(),
            source: None,
        })?;

    let encoded_state = query
        .get("state")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid_request("state param not found"))?;
    let state = decode_upstream_state_param(&service.state_codec, encoded_state)?;

    let csrf_matches: bool = state
        .csrf_token
        .secret()
        .as_bytes()
        .ct_eq(csrf_from_cookie.secret().as_bytes())
        .into();
    if !csrf_matches {
        return Err(CommonError::Forbidden {
            msg: "CSRF value does not match".to_string(),
            source: None,
        });
    }

    let engine = service.engine.as_ref();
    let mut request = engine
        .new_authorize_request(&AuthorizeForm::parse(&state.auth_params))
        .await
        .map_err(|err| {
            log_authorize_error("error using state downstream auth params", &err);
            invalid_request("error using state downstream auth params")
        })?;
    grant_scopes_if_requested(&mut request);

    let upstream = service
        .upstreams
        .snapshot()
        .find_oidc_by_name(&state.upstream_name)
        .ok_or_else(|| {
            tracing::warn!(
                upstream_name = %state.upstream_name,
                "upstream provider from state param not found"
            );
            CommonError::Unprocessable {
                msg: "upstream provider not found".to_string(),
                source: None,
            }
        })?;

    if let Some(upstream_error) = query.get("error") {
        tracing::info!(
            upstream_name = upstream.name(),
            error = upstream_error,
            error_description = query.get("error_description").unwrap_or_default(),
            "upstream provider returned an error"
        );
        return Err(invalid_request("login error from upstream provider"));
    }
    let authcode = query
        .get("code")
        .filter(|c| !c.is_empty())
        .ok_or_else(|| invalid_request("code param not found"))?;

    let tokens = upstream
        .exchange_authcode_and_validate_tokens(
            authcode,
            &state.pkce_code,
            &state.nonce,
            &service.callback_url,
        )
        .await
        .map_err(|e| {
            tracing::warn!(
                upstream_name = upstream.name(),
                error = %error_chain(&e),
                "error exchanging and validating upstream tokens"
            );
            CommonError::BadGateway {
                msg: "error exchanging and validating upstream tokens".to_string(),
                source: Some(e.into()),
            }
        })?;

    let identity =
        downstream_identity_from_upstream_id_token(upstream.as_ref(), &tokens.id_token_claims)?;
    Ok(make_downstream_session_and_return_authcode_redirect(engine, &request, identity).await)
}
