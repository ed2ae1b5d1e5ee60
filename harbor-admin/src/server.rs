use crate::handlers;
use axum::{
    Router,
    routing::{get, put},
};
use harbor_agent::ServiceManager;
use harbor_core::config::AdminConfig;
use std::sync::Arc;
use tracing::info;

/// Shared state for the agent API.
pub struct AdminState {
    pub manager: ServiceManager,
    pub central_config_enabled: bool,
}

/// Build the axum router with every agent API route.
pub fn build_admin_router(state: Arc<AdminState>) -> Router {
    let agent_api = Router::new()
        .route(
            "/service/register",
            put(handlers::services::register_service),
        )
        .route(
            "/service/deregister/{id}",
            put(handlers::services::deregister_service),
        )
        .route("/service/{id}", get(handlers::services::get_service))
        .route("/services", get(handlers::services::list_services));

    Router::new()
        .nest("/v1/agent", agent_api)
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .with_state(state)
}

/// Serve the agent API until `shutdown` resolves.
pub async fn start_admin<F>(
    config: AdminConfig,
    state: Arc<AdminState>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if !config.enabled {
        info!("Agent API disabled");
        return Ok(());
    }

    let app = build_admin_router(state);
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!(addr = %config.addr, "Agent API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
