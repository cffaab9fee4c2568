//! An upstream OIDC provider configured from its discovery document.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use openidconnect::core::{CoreClient, CoreProviderMetadata, CoreTokenResponse};
use openidconnect::{
    AuthorizationCode, ClientId, ClientSecret, EndpointMaybeSet, EndpointNotSet, EndpointSet,
    IssuerUrl, Nonce as OidcNonce, OAuth2TokenResponse, RedirectUrl, ResourceOwnerPassword,
    ResourceOwnerUsername, Scope, TokenResponse,
};
use serde_json::{Map, Value};
use shared::error::CommonError;
use url::Url;

use crate::config::OidcUpstreamConfig;
use crate::logic::security_values::{Nonce, PkceCode};
use crate::logic::upstream::{UpstreamOidcIdentityProvider, UpstreamTokens};

type DiscoveredClient = CoreClient<
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointMaybeSet,
    EndpointMaybeSet,
>;

pub struct ProviderConfigOidcUpstream {
    name: String,
    client_id: String,
    authorization_url: Url,
    scopes: Vec<String>,
    username_claim: String,
    groups_claim: Option<String>,
    allow_password_grant: bool,
    client: DiscoveredClient,
    http_client: reqwest::Client,
}

fn create_http_client(timeout: Duration) -> Result<reqwest::Client, CommonError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|e| CommonError::Unknown(anyhow::anyhow!("Failed to create HTTP client: {e}")))
}

impl ProviderConfigOidcUpstream {
    /// Fetches the issuer's discovery document and signing keys.
    pub async fn discover(config: &OidcUpstreamConfig) -> Result<Self, CommonError> {
        let http_client = create_http_client(Duration::from_secs(config.timeout_seconds))?;

        let issuer = IssuerUrl::new(config.issuer.clone()).map_err(|e| {
            CommonError::InvalidRequest {
                msg: format!("Invalid issuer URL for upstream {}: {e}", config.name),
                source: None,
            }
        })?;

        let provider_metadata = CoreProviderMetadata::discover_async(issuer, &http_client)
            .await
            .map_err(|e| {
                CommonError::Unknown(anyhow::anyhow!(
                    "Failed to discover OIDC provider metadata for upstream {}: {e}",
                    config.name
                ))
            })?;

        let authorization_url = provider_metadata.authorization_endpoint().url().clone();

        let client = CoreClient::from_provider_metadata(
            provider_metadata,
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.expose().to_string())),
        );

        tracing::info!(
            upstream_name = %config.name,
            issuer = %config.issuer,
            "discovered upstream OIDC provider"
        );

        Ok(Self {
            name: config.name.clone(),
            client_id: config.client_id.clone(),
            authorization_url,
            scopes: config.scopes.clone(),
            username_claim: config.username_claim.clone(),
            groups_claim: config.groups_claim.clone(),
            allow_password_grant: config.allow_password_grant,
            client,
            http_client,
        })
    }

    /// Verifies the ID token (signature, issuer, audience, expiry and, when
    /// given, the nonce) and returns all of its claims.
    fn validate_tokens(
        &self,
        token_response: &CoreTokenResponse,
        expected_nonce: Option<&Nonce>,
    ) -> Result<UpstreamTokens, CommonError> {
        let id_token = token_response.id_token().ok_or_else(|| {
            CommonError::Unknown(anyhow::anyhow!("No ID token in upstream token response"))
        })?;

        let verifier = self.client.id_token_verifier();
        let verified = match expected_nonce {
            Some(nonce) => id_token
                .claims(&verifier, &OidcNonce::new(nonce.secret().to_string()))
                .map(|_| ()),
            None => id_token
                .claims(&verifier, |_: Option<&OidcNonce>| Ok::<(), String>(()))
                .map(|_| ()),
        };
        verified.map_err(|e| {
            CommonError::Unknown(anyhow::anyhow!("ID token verification failed: {e}"))
        })?;

        let raw = serde_json::to_value(id_token)?;
        let compact = raw.as_str().ok_or_else(|| {
            CommonError::Unknown(anyhow::anyhow!("ID token did not serialize as a JWT"))
        })?;

        Ok(UpstreamTokens {
            id_token_claims: decode_jwt_payload(compact)?,
            access_token: Some(token_response.access_token().secret().to_string()),
            refresh_token: token_response
                .refresh_token()
                .map(|t| t.secret().to_string()),
        })
    }
}

/// Reads the payload segment of a compact JWT. Only call on a token whose
/// signature has already been verified.
pub(crate) fn decode_jwt_payload(jwt: &str) -> Result<Map<String, Value>, CommonError> {
    let payload = jwt.split('.').nth(1).ok_or_else(|| {
        CommonError::Unknown(anyhow::anyhow!("JWT does not have a payload segment"))
    })?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CommonError::Unknown(anyhow::anyhow!("JWT payload is not base64url: {e}")))?;

    match serde_json::from_slice(&bytes)? {
        Value::Object(claims) => Ok(claims),
        _ => Err(CommonError::Unknown(anyhow::anyhow!(
            "JWT payload is not a JSON object"
        ))),
    }
}

#[async_trait]
impl UpstreamOidcIdentityProvider for ProviderConfigOidcUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn authorization_url(&self) -> &Url {
        &self.authorization_url
    }

    fn scopes(&self) -> &[String] {
        &self.scopes
    }

    fn username_claim(&self) -> &str {
        &self.username_claim
    }

    fn groups_claim(&self) -> Option<&str> {
        self.groups_claim.as_deref()
    }

    fn allows_password_grant(&self) -> bool {
        self.allow_password_grant
    }

    async fn password_credentials_grant_and_validate_tokens(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UpstreamTokens, CommonError> {
        let username = ResourceOwnerUsername::new(username.to_string());
        let password = ResourceOwnerPassword::new(password.to_string());

        let token_response = self
            .client
            .exchange_password(&username, &password)
            .map_err(|e| {
                CommonError::Unknown(anyhow::anyhow!("Failed to build token request: {e}"))
            })?
            .add_scopes(self.scopes.iter().cloned().map(Scope::new))
            .request_async(&self.http_client)
            .await
            .map_err(|e| {
                CommonError::Unknown(anyhow::anyhow!("Password grant token request failed: {e}"))
            })?;

        // The password grant has no nonce.
        self.validate_tokens(&token_response, None)
    }

    async fn exchange_authcode_and_validate_tokens(
        &self,
        authcode: &str,
        pkce_code: &PkceCode,
        expected_nonce: &Nonce,
        redirect_uri: &Url,
    ) -> Result<UpstreamTokens, CommonError> {
        let client = self
            .client
            .clone()
            .set_redirect_uri(RedirectUrl::from_url(redirect_uri.clone()));

        let token_response = client
            .exchange_code(AuthorizationCode::new(authcode.to_string()))
            .map_err(|e| {
                CommonError::Unknown(anyhow::anyhow!("Failed to build token request: {e}"))
            })?
            .set_pkce_verifier(pkce_code.verifier())
            .request_async(&self.http_client)
            .await
            .map_err(|e| {
                CommonError::Unknown(anyhow::anyhow!("Token exchange failed: {e}"))
            })?;

        self.validate_tokens(&token_response, Some(expected_nonce))
    }
}
