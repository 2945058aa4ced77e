//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use openapi_server::models::{
    BuildLogEvent, DeploymentAccepted, ErrorResponse, HealthResponse, LogEndEvent,
    RuntimeLogEvent, RuntimeLogsQuery, VersionResponse,
};
use tracing::{debug, error};

use crate::errors::EngineError;
use crate::models::{NewDomain, NewService, ServiceSettingsUpdate};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Interval of SSE heartbeat comments
pub const SSE_HEARTBEAT: Duration = Duration::from_secs(15);

/// HTTP status for an engine error
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::ImageGone(_) => StatusCode::GONE,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else if self.is_rejection() {
            debug!("Request rejected: {}", self);
        }
        let body = ErrorResponse {
            error: self.to_string(),
            kind: self.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "frostd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// =============================== DEPLOYMENTS ================================== //

pub async fn create_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(service_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let deployment = state.orchestrator.create_deployment(&service_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DeploymentAccepted {
            deployment_id: deployment.id,
        }),
    ))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Path(service_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    Ok(Json(state.orchestrator.list_deployments(&service_id).await?))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    Ok(Json(state.orchestrator.get_deployment(&deployment_id).await?))
}

pub async fn replicas_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    Ok(Json(state.orchestrator.get_replicas(&deployment_id).await?))
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let deployment = state.orchestrator.rollback(&deployment_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DeploymentAccepted {
            deployment_id: deployment.id,
        }),
    ))
}

pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let deployment = state.orchestrator.cancel_deployment(&deployment_id).await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

pub async fn stop_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    Ok(Json(state.orchestrator.stop_deployment(&deployment_id).await?))
}

// ================================== LOGS ====================================== //

/// Build log as SSE: history, live lines, then an `end` event with the final status
pub async fn build_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, EngineError> {
    let subscription = state
        .orchestrator
        .subscribe_build_logs(&deployment_id)
        .await?;

    let lines = subscription
        .into_stream()
        .map(|line| Event::default().json_data(BuildLogEvent { line }));

    let orchestrator = state.orchestrator.clone();
    let end = stream::once(async move {
        let status = orchestrator
            .get_deployment(&deployment_id)
            .await
            .map(|d| d.status.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Event::default()
            .event("end")
            .json_data(LogEndEvent { status })
    });

    Ok(Sse::new(lines.chain(end)).keep_alive(KeepAlive::new().interval(SSE_HEARTBEAT)))
}

/// Container output as SSE until every followed replica stops
pub async fn runtime_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
    Query(query): Query<RuntimeLogsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, EngineError> {
    let subscription = state
        .orchestrator
        .subscribe_runtime_logs(&deployment_id, query.replica)
        .await?;

    let events = stream::unfold(subscription, |mut subscription| async move {
        let line = subscription.next_line().await?;
        let event = RuntimeLogEvent {
            replica_index: line.replica_index,
            line: line.line,
        };
        let event = match Event::default().json_data(&event) {
            Ok(event) => event,
            Err(_) => Event::default().comment("unencodable line"),
        };
        Some((Ok(event), subscription))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_HEARTBEAT)))
}

// ================================ SERVICES ==================================== //

pub async fn create_service_handler(
    State(state): State<Arc<ServerState>>,
    Json(input): Json<NewService>,
) -> Result<impl IntoResponse, EngineError> {
    let service = state.orchestrator.create_service(input).await?;
    Ok((StatusCode::CREATED, Json(service)))
}

pub async fn update_service_handler(
    State(state): State<Arc<ServerState>>,
    Path(service_id): Path<String>,
    Json(update): Json<ServiceSettingsUpdate>,
) -> Result<impl IntoResponse, EngineError> {
    Ok(Json(
        state
            .orchestrator
            .update_service_settings(&service_id, update)
            .await?,
    ))
}

pub async fn referenced_images_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, EngineError> {
    Ok(Json(state.orchestrator.referenced_images().await?))
}

// ================================= DOMAINS ==================================== //

pub async fn add_domain_handler(
    State(state): State<Arc<ServerState>>,
    Json(input): Json<NewDomain>,
) -> Result<impl IntoResponse, EngineError> {
    let domain = state.orchestrator.add_domain(input).await?;
    Ok((StatusCode::CREATED, Json(domain)))
}

pub async fn verify_domain_handler(
    State(state): State<Arc<ServerState>>,
    Path(domain_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    Ok(Json(state.orchestrator.verify_domain(&domain_id).await?))
}

pub async fn remove_domain_handler(
    State(state): State<Arc<ServerState>>,
    Path(domain_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    Ok(Json(state.orchestrator.remove_domain(&domain_id).await?))
}
