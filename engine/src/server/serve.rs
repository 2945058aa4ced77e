//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::EngineError;
use crate::server::handlers::{
    add_domain_handler, build_logs_handler, cancel_handler, create_deployment_handler,
    create_service_handler, get_deployment_handler, health_handler, list_deployments_handler,
    referenced_images_handler, remove_domain_handler, replicas_handler, rollback_handler,
    runtime_logs_handler, stop_handler, update_service_handler, verify_domain_handler,
    version_handler,
};
use crate::server::state::ServerState;

/// Engine API routes
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Services
        .route("/services", post(create_service_handler))
        .route("/services/{id}", patch(update_service_handler))
        .route(
            "/services/{id}/deployments",
            post(create_deployment_handler).get(list_deployments_handler),
        )
        // Deployments
        .route("/deployments/{id}", get(get_deployment_handler))
        .route("/deployments/{id}/replicas", get(replicas_handler))
        .route("/deployments/{id}/rollback", post(rollback_handler))
        .route("/deployments/{id}/cancel", post(cancel_handler))
        .route("/deployments/{id}/stop", post(stop_handler))
        .route("/deployments/{id}/logs", get(build_logs_handler))
        .route("/deployments/{id}/runtime-logs", get(runtime_logs_handler))
        // Domains
        .route("/domains", post(add_domain_handler))
        .route("/domains/{id}", delete(remove_domain_handler))
        .route("/domains/{id}/verify", post(verify_domain_handler))
        // Cleanup collaborator
        .route("/images/referenced", get(referenced_images_handler))
        // State and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| EngineError::ServerError(e.to_string()))
    });

    Ok(handle)
}
