use std::sync::Arc;

use shared::error::CommonError;
use url::Url;

use crate::logic::codec::SecureCodec;
use crate::logic::provider_engine::ProviderEngine;
use crate::logic::security_values::SecurityValueGenerator;
use crate::logic::upstream::{UpstreamIdentityProvidersLister, UpstreamSelectionPolicy};

const CALLBACK_PATH: &str = "callback";

/// Parameters for constructing a FederationService
pub struct FederationServiceParams {
    pub issuer: Url,
    pub upstreams: Arc<dyn UpstreamIdentityProvidersLister>,
    pub selection_policy: Arc<dyn UpstreamSelectionPolicy>,
    /// Engine that records authorization codes.
    pub engine: Arc<dyn ProviderEngine>,
    /// Engine that only validates; used before redirecting upstream.
    pub validation_engine: Arc<dyn ProviderEngine>,
    pub security_values: Arc<dyn SecurityValueGenerator>,
    pub state_codec: SecureCodec,
    pub cookie_codec: SecureCodec,
}

/// Everything a request handler reads. All of it is shared read-only.
#[derive(Clone)]
pub struct FederationService {
    pub issuer: Url,
    pub callback_url: Url,
    pub upstreams: Arc<dyn UpstreamIdentityProvidersLister>,
    pub selection_policy: Arc<dyn UpstreamSelectionPolicy>,
    pub engine: Arc<dyn ProviderEngine>,
    pub validation_engine: Arc<dyn ProviderEngine>,
    pub security_values: Arc<dyn SecurityValueGenerator>,
    pub state_codec: SecureCodec,
    pub cookie_codec: SecureCodec,
}

/// `{issuer}/callback`, keeping any path the issuer already has.
pub fn callback_url_for_issuer(issuer: &Url) -> Result<Url, CommonError> {
    let callback = format!("{}/{CALLBACK_PATH}", issuer.as_str().trim_end_matches('/'));
    Ok(Url::parse(&callback)?)
}

impl FederationService {
    pub fn new(params: FederationServiceParams) -> Result<Self, CommonError> {
        let callback_url = callback_url_for_issuer(&params.issuer)?;

        Ok(Self {
            issuer: params.issuer,
            callback_url,
            upstreams: params.upstreams,
            selection_policy: params.selection_policy,
            engine: params.engine,
            validation_engine: params.validation_engine,
            security_values: params.security_values,
            state_codec: params.state_codec,
            cookie_codec: params.cookie_codec,
        })
    }

    /// Path under which the router is mounted; the issuer URL's path.
    pub fn issuer_path(&self) -> &str {
        self.issuer.path().trim_end_matches('/')
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;

    #[test]
    fn test_callback_url_keeps_issuer_path() {
        let issuer = Url::parse("https://fed.example.com/some/path/").unwrap();
        assert_eq!(
            callback_url_for_issuer(&issuer).unwrap().as_str(),
            "https://fed.example.com/some/path/callback"
        );

        let issuer = Url::parse("https://fed.example.com").unwrap();
        assert_eq!(
            callback_url_for_issuer(&issuer).unwrap().as_str(),
            "https://fed.example.com/callback"
        );
    }
}
