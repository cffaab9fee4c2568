use axum::Router;
use axum::routing::any;
use http::{HeaderValue, header};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::service::FederationService;

mod authorize;
mod callback;

pub const AUTHORIZE_PATH: &str = "/oauth2/authorize";
pub const CALLBACK_PATH: &str = "/callback";

/// Headers set on every response, whichever path produced it.
const SECURITY_HEADERS: [(header::HeaderName, &str); 9] = [
    (
        header::CONTENT_SECURITY_POLICY,
        "default-src 'none'; frame-ancestors 'none'",
    ),
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (header::X_XSS_PROTECTION, "1; mode=block"),
    (header::REFERRER_POLICY, "no-referrer"),
    (header::X_DNS_PREFETCH_CONTROL, "off"),
    (
        header::CACHE_CONTROL,
        "no-cache, no-store, max-age=0, must-revalidate",
    ),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "0"),
];

fn with_security_headers(router: Router) -> Router {
    SECURITY_HEADERS
        .into_iter()
        .fold(router, |router, (name, value)| {
            router.layer(SetResponseHeaderLayer::overriding(
                name,
                HeaderValue::from_static(value),
            ))
        })
}

/// Mounts the authorization and callback endpoints under the issuer's path.
pub fn create_router(service: FederationService) -> Router {
    let issuer_path = service.issuer_path().to_string();

    let routes = Router::new()
        .route(AUTHORIZE_PATH, any(authorize::route_authorize))
        .route(CALLBACK_PATH, any(callback::route_callback))
        .with_state(service);

    let router = if issuer_path.is_empty() {
        routes
    } else {
        Router::new().nest(&issuer_path, routes)
    };

    with_security_headers(router).layer(TraceLayer::new_for_http())
}
