//! An upstream LDAP directory authenticated with search-then-bind.

use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, ldap_escape};
use shared::error::CommonError;
use url::Url;

use crate::config::{LdapGroupSearchConfig, LdapUpstreamConfig, LdapUserSearchConfig, SecretString};
use crate::logic::upstream::{AuthenticatedUser, UpstreamLdapIdentityProvider};

/// Attribute name meaning "the entry's distinguished name".
const DN_ATTRIBUTE: &str = "dn";
const LDAP_INVALID_CREDENTIALS: u32 = 49;
const FILTER_PLACEHOLDER: &str = "{}";

pub struct LdapDirectoryUpstream {
    name: String,
    server_url: String,
    url: Url,
    bind_dn: String,
    bind_password: SecretString,
    user_search: LdapUserSearchConfig,
    group_search: Option<LdapGroupSearchConfig>,
    timeout: Duration,
}

fn ldap_error(context: &str, e: impl std::fmt::Display) -> CommonError {
    CommonError::Unknown(anyhow::anyhow!("{context}: {e}"))
}

impl LdapDirectoryUpstream {
    pub fn new(config: &LdapUpstreamConfig) -> Result<Self, CommonError> {
        let mut url = Url::parse(&config.url)?;
        if !matches!(url.scheme(), "ldap" | "ldaps") {
            return Err(CommonError::InvalidRequest {
                msg: format!(
                    "LDAP upstream {} must use an ldap:// or ldaps:// URL",
                    config.name
                ),
                source: None,
            });
        }
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("base", &config.user_search.base);

        Ok(Self {
            name: config.name.clone(),
            server_url: config.url.clone(),
            url,
            bind_dn: config.bind_dn.clone(),
            bind_password: config.bind_password.clone(),
            user_search: config.user_search.clone(),
            group_search: config.group_search.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    fn user_search_filter(&self, username: &str) -> String {
        self.user_search
            .filter
            .replace(FILTER_PLACEHOLDER, &ldap_escape(username))
    }

    async fn connect(&self) -> Result<Ldap, CommonError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.server_url)
            .await
            .map_err(|e| ldap_error("error connecting to LDAP server", e))?;
        ldap3::drive!(conn);
        Ok(ldap)
    }

    async fn bind_service_account(&self, ldap: &mut Ldap) -> Result<(), CommonError> {
        ldap.with_timeout(self.timeout)
            .simple_bind(&self.bind_dn, self.bind_password.expose())
            .await
            .and_then(|res| res.success())
            .map_err(|e| ldap_error("error binding as LDAP service account", e))?;
        Ok(())
    }

    async fn search(
        &self,
        ldap: &mut Ldap,
        base: &str,
        filter: &str,
        attributes: Vec<&str>,
    ) -> Result<Vec<SearchEntry>, CommonError> {
        let (entries, _) = ldap
            .with_timeout(self.timeout)
            .search(base, Scope::Subtree, filter, attributes)
            .await
            .and_then(|res| res.success())
            .map_err(|e| ldap_error("error searching LDAP directory", e))?;
        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }

    async fn authenticate_on(
        &self,
        ldap: &mut Ldap,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedUser>, CommonError> {
        self.bind_service_account(ldap).await?;

        let filter = self.user_search_filter(username);
        let mut entries = self
            .search(
                ldap,
                &self.user_search.base,
                &filter,
                vec![
                    self.user_search.username_attribute.as_str(),
                    self.user_search.uid_attribute.as_str(),
                ],
            )
            .await?;

        let entry = match entries.len() {
            0 => {
                tracing::debug!(upstream_name = %self.name, "LDAP user search found no entries");
                return Ok(None);
            }
            1 => entries.remove(0),
            found => {
                return Err(ldap_error(
                    "LDAP user search is ambiguous",
                    format!("found {found} entries for one username"),
                ));
            }
        };

        let user_bind = ldap
            .with_timeout(self.timeout)
            .simple_bind(&entry.dn, password)
            .await
            .map_err(|e| ldap_error("error binding as LDAP user", e))?;
        if user_bind.rc == LDAP_INVALID_CREDENTIALS {
            return Ok(None);
        }
        user_bind
            .success()
            .map_err(|e| ldap_error("error binding as LDAP user", e))?;

        let name = attribute_value(&entry, &self.user_search.username_attribute)?;
        let uid = attribute_value(&entry, &self.user_search.uid_attribute)?;

        let groups = match &self.group_search {
            Some(group_search) => {
                self.bind_service_account(ldap).await?;
                self.search_groups(ldap, group_search, &entry.dn).await?
            }
            None => Vec::new(),
        };

        Ok(Some(AuthenticatedUser { name, uid, groups }))
    }

    async fn search_groups(
        &self,
        ldap: &mut Ldap,
        group_search: &LdapGroupSearchConfig,
        user_dn: &str,
    ) -> Result<Vec<String>, CommonError> {
        let filter = group_search
            .filter
            .replace(FILTER_PLACEHOLDER, &ldap_escape(user_dn));
        let entries = self
            .search(
                ldap,
                &group_search.base,
                &filter,
                vec![group_search.group_name_attribute.as_str()],
            )
            .await?;

        entries
            .iter()
            .map(|entry| attribute_value(entry, &group_search.group_name_attribute))
            .collect()
    }
}

fn attribute_value(entry: &SearchEntry, attribute: &str) -> Result<String, CommonError> {
    if attribute.eq_ignore_ascii_case(DN_ATTRIBUTE) {
        return Ok(entry.dn.clone());
    }
    entry
        .attrs
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
        .and_then(|(_, values)| values.first())
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| {
            ldap_error(
                "LDAP entry is missing a required attribute",
                format!("{attribute} on {}", entry.dn),
            )
        })
}

#[async_trait]
impl UpstreamLdapIdentityProvider for LdapDirectoryUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &Url {
        &self.url
    }

    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedUser>, CommonError> {
        // An empty password would be an unauthenticated bind, which servers accept.
        if password.is_empty() {
            return Ok(None);
        }

        let mut ldap = self.connect().await?;
        let result = self.authenticate_on(&mut ldap, username, password).await;
        if let Err(e) = ldap.unbind().await {
            tracing::debug!(upstream_name = %self.name, error = %e, "error unbinding from LDAP server");
        }
        result
    }
}
