use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, Method, header};

use crate::logic::authorize::handle_authorize;
use crate::logic::provider_engine::AuthorizeForm;
use crate::service::FederationService;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

fn is_form_body(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

/// Body parameters come first for POST, then the URL query.
fn authorize_form(method: &Method, headers: &HeaderMap, query: Option<&str>, body: &Bytes) -> AuthorizeForm {
    let query = AuthorizeForm::parse(query.unwrap_or_default());
    if *method != Method::POST || !is_form_body(headers) {
        return query;
    }
    let mut form = AuthorizeForm::parse(&String::from_utf8_lossy(body));
    form.extend(query);
    form
}

#[tracing::instrument(skip_all, fields(method = %method))]
pub(super) async fn route_authorize(
    State(service): State<FederationService>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let form = authorize_form(&method, &headers, query.as_deref(), &body);

    match handle_authorize(&service, &method, &headers, form).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
