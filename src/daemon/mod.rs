//! Daemon mode
//!
//! Wires settings, driver and peer service together and serves the REST API
//! until Ctrl+C or SIGTERM.

pub mod auth;
pub mod routes;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::{DriverKind, Settings};
use crate::driver::{AwgDriver, InterfaceDriver, MemoryDriver};
use crate::error::Result;
use crate::service::PeerService;

use auth::AuthState;
use routes::AppState;

/// HTTP front end for a [`PeerService`]
pub struct DaemonService {
    service: Arc<PeerService>,
    auth: AuthState,
    listen: SocketAddr,
}

impl DaemonService {
    pub fn new(service: Arc<PeerService>, api_key: String, listen: SocketAddr) -> Self {
        Self {
            service,
            auth: AuthState::new(api_key),
            listen,
        }
    }

    /// The full router, including request tracing
    pub fn router(&self) -> Router {
        routes::build_router(
            AppState {
                service: Arc::clone(&self.service),
            },
            self.auth.clone(),
        )
        .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.listen).await?;
        tracing::info!("API listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("API stopped");
        Ok(())
    }
}

/// Driver selected by `[interface]`
pub fn build_driver(settings: &Settings) -> Arc<dyn InterfaceDriver> {
    match settings.interface.driver {
        DriverKind::Awg => Arc::new(AwgDriver::new(
            settings.interface.tool.clone(),
            settings.interface.name.clone(),
        )),
        DriverKind::Memory => {
            tracing::warn!("Using the in-memory driver; no interface will be changed");
            Arc::new(MemoryDriver::new())
        }
    }
}

/// The configured API key, or a freshly generated one written to the token file
pub fn resolve_api_key(settings: &Settings) -> Result<String> {
    if let Some(key) = settings.api_key() {
        return Ok(key.to_string());
    }
    let token = auth::generate_token();
    auth::write_token_file(&token, &settings.api.token_path)?;
    Ok(token)
}

/// Load everything, reconcile, then serve until a shutdown signal
pub async fn serve(settings: Settings, listen: Option<SocketAddr>) -> Result<()> {
    let driver = build_driver(&settings);
    let service = Arc::new(PeerService::open(&settings, driver)?);

    if settings.interface.reconcile_on_start {
        service
            .startup_reconcile(settings.interface.prune_unknown)
            .await?;
    } else {
        tracing::info!("Startup reconciliation disabled");
    }

    let api_key = resolve_api_key(&settings)?;
    let listen = listen.unwrap_or(settings.api.listen);

    DaemonService::new(service, api_key, listen)
        .run(shutdown_signal())
        .await
}

/// Resolves on Ctrl+C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
