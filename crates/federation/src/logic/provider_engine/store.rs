use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use shared::error::CommonError;
use url::Url;

use crate::logic::downstream_session::DownstreamSession;

/// Everything the token endpoint needs to redeem an authorization code.
#[derive(Debug, Clone)]
pub struct AuthorizeCodeRecord {
    pub client_id: String,
    pub redirect_uri: Url,
    pub granted_scopes: BTreeSet<String>,
    pub session: DownstreamSession,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuthorizeCodeStore: Send + Sync {
    async fn create_authorize_code_session(
        &self,
        code: &str,
        record: AuthorizeCodeRecord,
    ) -> Result<(), CommonError>;

    /// Removes and returns the record, so a code can be redeemed once.
    async fn take_authorize_code_session(
        &self,
        code: &str,
    ) -> Result<Option<AuthorizeCodeRecord>, CommonError>;
}

pub const DEFAULT_AUTHORIZE_CODE_LIFETIME_SECONDS: i64 = 600;

/// Process-local code store keyed by the authorization code. Records older
/// than the code lifetime are dropped on insert and never handed out.
#[derive(Clone)]
pub struct InMemoryAuthorizeCodeStore {
    codes: Arc<DashMap<String, AuthorizeCodeRecord>>,
    lifetime: Duration,
}

impl Default for InMemoryAuthorizeCodeStore {
    fn default() -> Self {
        Self::with_lifetime(Duration::seconds(DEFAULT_AUTHORIZE_CODE_LIFETIME_SECONDS))
    }
}

impl InMemoryAuthorizeCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            codes: Arc::new(DashMap::new()),
            lifetime,
        }
    }

    fn is_expired(&self, record: &AuthorizeCodeRecord, now: DateTime<Utc>) -> bool {
        now - record.created_at >= self.lifetime
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[async_trait]
impl AuthorizeCodeStore for InMemoryAuthorizeCodeStore {
    async fn create_authorize_code_session(
        &self,
        code: &str,
        record: AuthorizeCodeRecord,
    ) -> Result<(), CommonError> {
        let now = Utc::now();
        self.codes.retain(|_, existing| !self.is_expired(existing, now));
        self.codes.insert(code.to_string(), record);
        Ok(())
    }

    async fn take_authorize_code_session(
        &self,
        code: &str,
    ) -> Result<Option<AuthorizeCodeRecord>, CommonError> {
        let now = Utc::now();
        Ok(self
            .codes
            .remove(code)
            .map(|(_, record)| record)
            .filter(|record| !self.is_expired(record, now)))
    }
}
