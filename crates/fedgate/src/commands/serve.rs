use std::path::PathBuf;

use clap::Parser;
use federation::config::FederationConfig;
use shared::error::CommonError;
use tracing::info;

use crate::server::{StartAxumServerParams, start_axum_server};

#[derive(Debug, Clone, Parser)]
pub struct ServeParams {
    /// Path to the YAML configuration file
    #[arg(long, env = "FEDGATE_CONFIG")]
    pub config: PathBuf,
    #[arg(long, env = "FEDGATE_HOST", default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, env = "FEDGATE_PORT", default_value = "8443")]
    pub port: u16,
}

pub async fn cmd_serve(params: ServeParams) -> Result<(), CommonError> {
    let config = FederationConfig::load(&params.config)?;
    info!(
        issuer = %config.issuer,
        oidc_upstreams = config.upstreams.oidc.len(),
        ldap_upstreams = config.upstreams.ldap.len(),
        clients = config.clients.len(),
        "Loaded configuration from {}",
        params.config.display()
    );

    let service = config.into_service().await?;

    start_axum_server(StartAxumServerParams {
        host: params.host,
        port: params.port,
        service,
    })
    .await
}
