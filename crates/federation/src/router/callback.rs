use axum::extract::{RawQuery, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, Method};

use crate::logic::callback::handle_callback;
use crate::logic::provider_engine::AuthorizeForm;
use crate::service::FederationService;

#[tracing::instrument(skip_all, fields(method = %method))]
pub(super) async fn route_callback(
    State(service): State<FederationService>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = AuthorizeForm::parse(query.as_deref().unwrap_or_default());

    match handle_callback(&service, &method, &headers, query).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod unit_test {
    use std::sync::Arc;

    use axum::body::Body;
    use http::{Request, StatusCode, header};

    use super::*;
    use crate::logic::provider_engine::AuthorizeCodeStore;
    use crate::logic::upstream::UpstreamOidcIdentityProvider;
    use crate::test::fakes::{FIXED_CSRF, FIXED_NONCE, FIXED_PKCE_VERIFIER, FakeOidcUpstream};
    use crate::test::fixtures::{
        TEST_DOWNSTREAM_NONCE, TEST_DOWNSTREAM_STATE, TEST_REDIRECT_URI, TestContext,
        authorize_params, body_json, form_encode, location, query_value,
    };

    /// Runs the authorize leg and returns the upstream `state` it produced.
    async fn start_flow(ctx: &TestContext) -> String {
        let uri = format!(
            "{}?{}",
            ctx.authorize_path(),
            form_encode(&authorize_params(&[]))
        );
        let response = ctx
            .send(Request::get(uri).body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        query_value(&location(&response), "state").unwrap()
    }

    fn oidc_context(upstream: FakeOidcUpstream) -> (TestContext, Arc<FakeOidcUpstream>) {
        let oidc = Arc::new(upstream);
        let ctx = TestContext::new()
            .with_oidc_upstreams(vec![oidc.clone() as Arc<dyn UpstreamOidcIdentityProvider>]);
        (ctx, oidc)
    }

    fn callback_request(
        ctx: &TestContext,
        params: &[(&str, &str)],
        csrf_cookie: Option<&str>,
    ) -> Request<Body> {
        let params: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut builder = Request::get(format!("{}?{}", ctx.callback_path(), form_encode(&params)));
        if let Some(csrf) = csrf_cookie {
            builder = builder.header(header::COOKIE, ctx.csrf_cookie_header(csrf));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_callback_completes_downstream_authorization() {
        let (ctx, oidc) = oidc_context(FakeOidcUpstream::builder().groups_claim("groups").build());
        let state = start_flow(&ctx).await;

        let response = ctx
            .send(callback_request(
                &ctx,
                &[("code", "upstream-code"), ("state", state.as_str())],
                Some(FIXED_CSRF),
            ))
            .await;

        assert_eq!(response.status(), StatusCode::FOUND);
        let redirect = location(&response);
        assert!(redirect.as_str().starts_with(TEST_REDIRECT_URI));
        assert_eq!(
            query_value(&redirect, "state").as_deref(),
            Some(TEST_DOWNSTREAM_STATE)
        );

        let exchanges = oidc.exchanges();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].authcode, "upstream-code");
        assert_eq!(exchanges[0].pkce_verifier, FIXED_PKCE_VERIFIER);
        assert_eq!(exchanges[0].nonce, FIXED_NONCE);
        assert_eq!(
            exchanges[0].redirect_uri,
            "https://fed.example.com/issuer/callback"
        );

        let code = query_value(&redirect, "code").unwrap();
        let record = ctx
            .store
            .take_authorize_code_session(&code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.session.username, "alice@example.com");
        assert_eq!(record.session.groups, vec!["admins"]);
        assert_eq!(record.nonce.as_deref(), Some(TEST_DOWNSTREAM_NONCE));
        assert_eq!(record.code_challenge_method.as_deref(), Some("S256"));
    }

    #[tokio::test]
    async fn test_callback_rejects_missing_or_mismatched_csrf() {
        let (ctx, oidc) = oidc_context(FakeOidcUpstream::builder().build());
        let state = start_flow(&ctx).await;

        for cookie in [None, Some("another-csrf-value")] {
            let response = ctx
                .send(callback_request(
                    &ctx,
                    &[("code", "upstream-code"), ("state", state.as_str())],
                    cookie,
                ))
                .await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{cookie:?}");
        }
        assert!(oidc.exchanges().is_empty());
    }

    #[tokio::test]
    async fn test_callback_rejects_bad_query() {
        let (ctx, oidc) = oidc_context(FakeOidcUpstream::builder().build());
        let state = start_flow(&ctx).await;
        let mut tampered: Vec<char> = state.chars().collect();
        tampered[20] = if tampered[20] == 'A' { 'B' } else { 'A' };
        let tampered: String = tampered.into_iter().collect();

        let cases: [(&[(&str, &str)], &str); 4] = [
            (&[("code", "upstream-code")], "state param not found"),
            (&[("code", "upstream-code"), ("state", tampered.as_str())], "error reading state"),
            (&[("state", state.as_str())], "code param not found"),
            (
                &[("state", state.as_str()), ("error", "access_denied")],
                "login error from upstream provider",
            ),
        ];
        for (params, message) in cases {
            let response = ctx
                .send(callback_request(&ctx, params, Some(FIXED_CSRF)))
                .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{message}");
            assert_eq!(body_json(response).await["message"], message);
        }
        assert!(oidc.exchanges().is_empty());
    }

    #[tokio::test]
    async fn test_callback_exchange_failure_is_bad_gateway() {
        let (ctx, _oidc) = oidc_context(
            FakeOidcUpstream::builder()
                .exchange_error("invalid_grant: code expired")
                .build(),
        );
        let state = start_flow(&ctx).await;

        let response = ctx
            .send(callback_request(
                &ctx,
                &[("code", "upstream-code"), ("state", state.as_str())],
                Some(FIXED_CSRF),
            ))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(ctx.store.is_empty());
        assert!(!body_json(response).await.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_callback_upstream_removed_after_redirect() {
        let (ctx, _oidc) = oidc_context(FakeOidcUpstream::builder().build());
        let state = start_flow(&ctx).await;
        ctx.upstreams.set_oidc_identity_providers(vec![Arc::new(
            FakeOidcUpstream::builder().name("replacement-idp").build(),
        ) as Arc<dyn UpstreamOidcIdentityProvider>]);

        let response = ctx
            .send(callback_request(
                &ctx,
                &[("code", "upstream-code"), ("state", state.as_str())],
                Some(FIXED_CSRF),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_callback_only_accepts_get() {
        let (ctx, _oidc) = oidc_context(FakeOidcUpstream::builder().build());
        let request = Request::post(ctx.callback_path())
            .body(Body::empty())
            .unwrap();

        let response = ctx.send(request).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(header::ALLOW).unwrap(), "GET");
    }
}
