//! YAML configuration for a federation gateway instance.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use shared::error::CommonError;
use url::Url;

use crate::logic::codec::{CodecKey, SecureCodec};
use crate::logic::provider_engine::{
    DEFAULT_AUTHORIZE_CODE_LIFETIME_SECONDS, DefaultProviderEngine, DownstreamClient,
    InMemoryAuthorizeCodeStore,
};
use crate::logic::security_values::RandomSecurityValues;
use crate::logic::upstream::ldap::LdapDirectoryUpstream;
use crate::logic::upstream::oidc::ProviderConfigOidcUpstream;
use crate::logic::upstream::{
    DynamicUpstreamIdpProvider, SingleUpstreamPolicy, UpstreamLdapIdentityProvider,
    UpstreamOidcIdentityProvider,
};
use crate::service::{FederationService, FederationServiceParams};

/// A string that never appears in `Debug` output.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[redacted]")
    }
}

fn default_state_max_age_seconds() -> i64 {
    900
}

fn default_csrf_cookie_max_age_seconds() -> i64 {
    86400
}

fn default_authorize_code_lifetime_seconds() -> i64 {
    DEFAULT_AUTHORIZE_CODE_LIFETIME_SECONDS
}

fn default_oidc_scopes() -> Vec<String> {
    ["openid", "offline_access", "email", "profile"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_username_claim() -> String {
    "email".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Downstream issuer. The callback endpoint is `{issuer}/callback`.
    pub issuer: String,
    /// Base64 AES-256 keys. The first encodes, all decode.
    pub state_keys: Vec<SecretString>,
    pub cookie_keys: Vec<SecretString>,
    #[serde(default = "default_state_max_age_seconds")]
    pub state_max_age_seconds: i64,
    #[serde(default = "default_csrf_cookie_max_age_seconds")]
    pub csrf_cookie_max_age_seconds: i64,
    /// Unredeemed authorization codes are discarded after this long.
    #[serde(default = "default_authorize_code_lifetime_seconds")]
    pub authorize_code_lifetime_seconds: i64,
    #[serde(default)]
    pub clients: Vec<DownstreamClient>,
    #[serde(default)]
    pub upstreams: UpstreamsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamsConfig {
    #[serde(default)]
    pub oidc: Vec<OidcUpstreamConfig>,
    #[serde(default)]
    pub ldap: Vec<LdapUpstreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OidcUpstreamConfig {
    pub name: String,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: SecretString,
    #[serde(default = "default_oidc_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub allow_password_grant: bool,
    #[serde(default = "default_username_claim")]
    pub username_claim: String,
    #[serde(default)]
    pub groups_claim: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapUpstreamConfig {
    pub name: String,
    /// `ldap://` or `ldaps://` server URL.
    pub url: String,
    pub bind_dn: String,
    pub bind_password: SecretString,
    pub user_search: LdapUserSearchConfig,
    #[serde(default)]
    pub group_search: Option<LdapGroupSearchConfig>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapUserSearchConfig {
    pub base: String,
    /// `{}` is replaced with the escaped username.
    pub filter: String,
    pub username_attribute: String,
    /// `dn` selects the entry's distinguished name.
    pub uid_attribute: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapGroupSearchConfig {
    pub base: String,
    /// `{}` is replaced with the escaped user DN.
    pub filter: String,
    pub group_name_attribute: String,
}

fn invalid_config(msg: impl Into<String>, source: impl Into<anyhow::Error>) -> CommonError {
    CommonError::InvalidRequest {
        msg: msg.into(),
        source: Some(source.into()),
    }
}

fn positive_duration(field: &str, seconds: i64) -> Result<chrono::Duration, CommonError> {
    chrono::Duration::try_seconds(seconds)
        .filter(|d| *d > chrono::Duration::zero())
        .ok_or_else(|| {
            invalid_config(
                format!("invalid {field}"),
                anyhow::anyhow!("{field} must be a positive number of seconds, got {seconds}"),
            )
        })
}

fn codec_from_keys(
    field: &str,
    keys: &[SecretString],
    max_age_field: &str,
    max_age_seconds: i64,
) -> Result<SecureCodec, CommonError> {
    let max_age = positive_duration(max_age_field, max_age_seconds)?;
    let keys = keys
        .iter()
        .map(|k| CodecKey::from_base64(k.expose()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid_config(format!("invalid key in {field}"), e))?;
    SecureCodec::new(keys, Some(max_age))
        .map_err(|e| invalid_config(format!("invalid {field}"), e))
}

impl FederationConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CommonError> {
        serde_yaml::from_str(yaml).map_err(|e| invalid_config("invalid configuration file", e))
    }

    pub fn load(path: &Path) -> Result<Self, CommonError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn issuer_url(&self) -> Result<Url, CommonError> {
        Url::parse(&self.issuer).map_err(|e| invalid_config("invalid issuer URL", e))
    }

    pub fn state_codec(&self) -> Result<SecureCodec, CommonError> {
        codec_from_keys(
            "state_keys",
            &self.state_keys,
            "state_max_age_seconds",
            self.state_max_age_seconds,
        )
    }

    pub fn cookie_codec(&self) -> Result<SecureCodec, CommonError> {
        codec_from_keys(
            "cookie_keys",
            &self.cookie_keys,
            "csrf_cookie_max_age_seconds",
            self.csrf_cookie_max_age_seconds,
        )
    }

    pub fn authorize_code_store(&self) -> Result<InMemoryAuthorizeCodeStore, CommonError> {
        let lifetime = positive_duration(
            "authorize_code_lifetime_seconds",
            self.authorize_code_lifetime_seconds,
        )?;
        Ok(InMemoryAuthorizeCodeStore::with_lifetime(lifetime))
    }

    /// Builds the upstreams (discovering each OIDC issuer) and the service.
    pub async fn into_service(self) -> Result<FederationService, CommonError> {
        let issuer = self.issuer_url()?;
        if issuer.scheme() != "https" {
            tracing::warn!(
                issuer = %issuer,
                "issuer is not https; browsers will not send the __Host- CSRF cookie"
            );
        }

        let state_codec = self.state_codec()?;
        let cookie_codec = self.cookie_codec()?;
        let code_store = self.authorize_code_store()?;

        let mut oidc: Vec<Arc<dyn UpstreamOidcIdentityProvider>> = Vec::new();
        for config in &self.upstreams.oidc {
            oidc.push(Arc::new(ProviderConfigOidcUpstream::discover(config).await?));
        }
        let ldap = self
            .upstreams
            .ldap
            .iter()
            .map(|config| {
                LdapDirectoryUpstream::new(config)
                    .map(|u| Arc::new(u) as Arc<dyn UpstreamLdapIdentityProvider>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let registry = DynamicUpstreamIdpProvider::new();
        registry.set_oidc_identity_providers(oidc);
        registry.set_ldap_identity_providers(ldap);

        let engine = DefaultProviderEngine::new(
            self.clients,
            Arc::new(code_store),
        );

        FederationService::new(FederationServiceParams {
            issuer,
            upstreams: Arc::new(registry),
            selection_policy: Arc::new(SingleUpstreamPolicy),
            validation_engine: Arc::new(engine.without_storage()),
            engine: Arc::new(engine),
            security_values: Arc::new(RandomSecurityValues),
            state_codec,
            cookie_codec,
        })
    }
}
