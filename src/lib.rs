pub mod address;
pub mod api;
pub mod config;
pub mod confirm;
pub mod error;
pub mod execute;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod threads;
pub mod tools;
pub mod utils;
pub mod workbook;

pub use config::{CliArgs, ServerConfig, TransportKind};
pub use error::ErrorCode;
pub use logging::{LoggingConfig, init_logging, shutdown_telemetry};
pub use server::SheetChatServer;
pub use shutdown::{ShutdownConfig, ShutdownCoordinator};
pub use state::AppState;

use anyhow::Result;
use axum::Router;
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use shutdown::{CompositeShutdownHandler, WorkbookShutdownHandler};
use std::sync::Arc;
use tokio::net::TcpListener;

const HTTP_SERVICE_PATH: &str = "/mcp";

pub async fn run_server(config: ServerConfig) -> Result<()> {
    let config = Arc::new(config);
    let state = Arc::new(AppState::open_blocking(config.clone()).await?);

    tracing::info!(
        transport = %config.transport,
        workbook = %config.workbook_path.display(),
        view = %config.view,
        max_tool_steps = config.max_tool_steps,
        require_confirmation = config.require_confirmation,
        "starting sheet-chat server",
    );

    let shutdown_config =
        ShutdownConfig::default().with_total_timeout(config.graceful_shutdown_timeout_secs);
    let coordinator = Arc::new(ShutdownCoordinator::new(shutdown_config));
    let mut handlers = CompositeShutdownHandler::new();
    handlers.add_handler(Box::new(WorkbookShutdownHandler::new(
        state.clone(),
        coordinator.config().flush_timeout,
    )));

    let result = match config.transport {
        TransportKind::Stdio => {
            let server = SheetChatServer::from_state(state.clone());
            tokio::select! {
                result = server.run_stdio() => result,
                _ = coordinator.wait_for_signal() => Ok(()),
            }
        }
        TransportKind::Http => {
            run_http_transport(config.clone(), state.clone(), coordinator.clone()).await
        }
    };

    if let Err(e) = coordinator.shutdown(&handlers).await {
        tracing::error!("error during shutdown: {:#}", e);
    }
    result
}

/// Everything served over HTTP: REST routes, `/mcp`, health and metrics.
pub fn build_router(state: Arc<AppState>) -> Router {
    let service_state = state.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(SheetChatServer::from_state(service_state.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let health_checker = Arc::new(health::HealthChecker::new(state.clone()));
    let health_routes = Router::new()
        .route("/health", axum::routing::get(health::liveness_handler))
        .route("/ready", axum::routing::get(health::readiness_handler))
        .with_state(health_checker);

    api::router(state)
        .merge(health_routes)
        .route("/metrics", axum::routing::get(metrics_handler))
        .nest_service(HTTP_SERVICE_PATH, mcp_service)
}

async fn metrics_handler() -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::OK, metrics::METRICS.encode())
}

async fn run_http_transport(
    config: Arc<ServerConfig>,
    state: Arc<AppState>,
    coordinator: Arc<ShutdownCoordinator>,
) -> Result<()> {
    let router = build_router(state);
    let listener = TcpListener::bind(config.http_bind_address).await?;
    let actual_addr = listener.local_addr()?;
    tracing::info!(transport = "http", bind = %actual_addr, path = HTTP_SERVICE_PATH, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { coordinator.wait_for_signal().await })
        .await?;
    tracing::info!("server stopped, running shutdown handlers");
    Ok(())
}
