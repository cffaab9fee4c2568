use std::net::SocketAddr;

use federation::router::create_router;
use federation::service::FederationService;
use shared::error::CommonError;
use tracing::{debug, info};

pub struct StartAxumServerParams {
    pub host: String,
    pub port: u16,
    pub service: FederationService,
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => debug!("Shutdown signal received (Ctrl+C)"),
        Err(e) => tracing::error!("Failed to listen for Ctrl+C: {e}"),
    }
    info!("Shutting down axum server, waiting for in-flight requests to complete...");
}

/// Serves the federation router until Ctrl+C.
pub async fn start_axum_server(params: StartAxumServerParams) -> Result<(), CommonError> {
    let addr: SocketAddr = format!("{}:{}", params.host, params.port)
        .parse()
        .map_err(|e| CommonError::AddrParseError { source: e })?;

    let issuer = params.service.issuer.clone();
    let router = create_router(params.service);
    info!("Router initiated");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(issuer = %issuer, "Starting server on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Axum server shut down gracefully");
    Ok(())
}
