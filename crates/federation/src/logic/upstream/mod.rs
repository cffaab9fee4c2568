//! Upstream identity providers, the snapshot of configured upstreams, and the
//! policy that picks the one upstream serving a request.

pub mod ldap;
pub mod oidc;

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::error::CommonError;
use url::Url;

use crate::logic::provider_engine::AuthorizeForm;
use crate::logic::security_values::{Nonce, PkceCode};

/// Tokens returned by an upstream OIDC provider, with ID token claims that
/// have already been validated.
#[derive(Clone, Default)]
pub struct UpstreamTokens {
    pub id_token_claims: Map<String, Value>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for UpstreamTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTokens")
            .field("id_token_claims", &self.id_token_claims)
            .field("access_token", &self.access_token.as_ref().map(|_| "[redacted]"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .finish()
    }
}

#[async_trait]
pub trait UpstreamOidcIdentityProvider: Send + Sync {
    fn name(&self) -> &str;
    fn client_id(&self) -> &str;
    fn authorization_url(&self) -> &Url;
    /// Scopes requested from the upstream, independent of the downstream request.
    fn scopes(&self) -> &[String];
    fn username_claim(&self) -> &str;
    fn groups_claim(&self) -> Option<&str>;
    fn allows_password_grant(&self) -> bool;

    async fn password_credentials_grant_and_validate_tokens(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UpstreamTokens, CommonError>;

    async fn exchange_authcode_and_validate_tokens(
        &self,
        authcode: &str,
        pkce_code: &PkceCode,
        expected_nonce: &Nonce,
        redirect_uri: &Url,
    ) -> Result<UpstreamTokens, CommonError>;
}

/// A user the LDAP directory has authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub name: String,
    pub uid: String,
    pub groups: Vec<String>,
}

#[async_trait]
pub trait UpstreamLdapIdentityProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Directory URL identifying this upstream; the base of downstream subjects.
    fn url(&self) -> &Url;

    /// `Ok(None)` means the directory rejected the credentials. `Err` is kept
    /// for transport and protocol failures.
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedUser>, CommonError>;
}

/// One consistent view of the configured upstreams.
#[derive(Clone, Default)]
pub struct UpstreamSnapshot {
    pub oidc: Vec<Arc<dyn UpstreamOidcIdentityProvider>>,
    pub ldap: Vec<Arc<dyn UpstreamLdapIdentityProvider>>,
}

impl UpstreamSnapshot {
    pub fn names(&self) -> Vec<String> {
        self.oidc
            .iter()
            .map(|p| p.name().to_string())
            .chain(self.ldap.iter().map(|p| p.name().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.oidc.len() + self.ldap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_oidc_by_name(&self, name: &str) -> Option<Arc<dyn UpstreamOidcIdentityProvider>> {
        self.oidc.iter().find(|p| p.name() == name).cloned()
    }
}

pub trait UpstreamIdentityProvidersLister: Send + Sync {
    fn oidc_identity_providers(&self) -> Vec<Arc<dyn UpstreamOidcIdentityProvider>>;
    fn ldap_identity_providers(&self) -> Vec<Arc<dyn UpstreamLdapIdentityProvider>>;

    fn snapshot(&self) -> UpstreamSnapshot {
        UpstreamSnapshot {
            oidc: self.oidc_identity_providers(),
            ldap: self.ldap_identity_providers(),
        }
    }
}

/// Lock-free upstream registry. The control plane swaps in new sets while
/// requests keep reading whichever snapshot they loaded.
#[derive(Default)]
pub struct DynamicUpstreamIdpProvider {
    current: ArcSwap<UpstreamSnapshot>,
}

impl DynamicUpstreamIdpProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_oidc_identity_providers(&self, oidc: Vec<Arc<dyn UpstreamOidcIdentityProvider>>) {
        self.current.rcu(|current| UpstreamSnapshot {
            oidc: oidc.clone(),
            ldap: current.ldap.clone(),
        });
    }

    pub fn set_ldap_identity_providers(&self, ldap: Vec<Arc<dyn UpstreamLdapIdentityProvider>>) {
        self.current.rcu(|current| UpstreamSnapshot {
            oidc: current.oidc.clone(),
            ldap: ldap.clone(),
        });
    }
}

impl UpstreamIdentityProvidersLister for DynamicUpstreamIdpProvider {
    fn oidc_identity_providers(&self) -> Vec<Arc<dyn UpstreamOidcIdentityProvider>> {
        self.current.load().oidc.clone()
    }

    fn ldap_identity_providers(&self) -> Vec<Arc<dyn UpstreamLdapIdentityProvider>> {
        self.current.load().ldap.clone()
    }

    fn snapshot(&self) -> UpstreamSnapshot {
        self.current.load_full().as_ref().clone()
    }
}

#[derive(Clone)]
pub enum SelectedUpstream {
    Oidc(Arc<dyn UpstreamOidcIdentityProvider>),
    Ldap(Arc<dyn UpstreamLdapIdentityProvider>),
}

impl SelectedUpstream {
    pub fn name(&self) -> &str {
        match self {
            SelectedUpstream::Oidc(p) => p.name(),
            SelectedUpstream::Ldap(p) => p.name(),
        }
    }
}

/// Chooses the upstream for one authorize request. Callers only see this
/// trait, so a hint-based policy can replace the single-upstream one.
pub trait UpstreamSelectionPolicy: Send + Sync {
    fn choose_upstream(
        &self,
        upstreams: &UpstreamSnapshot,
        form: &AuthorizeForm,
    ) -> Result<SelectedUpstream, CommonError>;
}

/// Supports exactly one configured upstream across all kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleUpstreamPolicy;

impl UpstreamSelectionPolicy for SingleUpstreamPolicy {
    fn choose_upstream(
        &self,
        upstreams: &UpstreamSnapshot,
        _form: &AuthorizeForm,
    ) -> Result<SelectedUpstream, CommonError> {
        match (upstreams.oidc.as_slice(), upstreams.ldap.as_slice()) {
            ([], []) => {
                tracing::warn!("authorize request rejected: no upstream providers are configured");
                Err(CommonError::Unprocessable {
                    msg: "No upstream providers are configured".to_string(),
                    source: None,
                })
            }
            ([oidc], []) => Ok(SelectedUpstream::Oidc(oidc.clone())),
            ([], [ldap]) => Ok(SelectedUpstream::Ldap(ldap.clone())),
            _ => {
                let names = upstreams.names();
                tracing::warn!(
                    upstream_names = ?names,
                    "too many upstream providers are configured (found {}): {}",
                    names.len(),
                    names.join(", ")
                );
                Err(CommonError::Unprocessable {
                    msg: "Too many upstream providers are configured (support for multiple upstreams is not yet implemented)".to_string(),
                    source: None,
                })
            }
        }
    }
}
