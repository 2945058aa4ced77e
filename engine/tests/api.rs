mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::*;
use frost_engine::server::serve::router;
use frost_engine::server::state::ServerState;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    router(Arc::new(ServerState::new(h.orchestrator.clone())))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let (status, body) = call(&app(&h), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "frostd");
}

#[tokio::test]
async fn test_deploy_lifecycle_over_http() {
    let h = harness();
    let app = app(&h);

    let (status, service) = call(
        &app,
        Method::POST,
        "/services",
        Some(serde_json::to_value(repo_service("web")).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let service_id = service["id"].as_str().unwrap().to_string();

    h.runtime.set_build_delay(Duration::from_millis(300));
    let uri = format!("/services/{}/deployments", service_id);
    let (status, accepted) = call(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let deployment_id = accepted["deployment_id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");

    let deployment = wait_settled(&h.orchestrator, &deployment_id).await;
    assert_eq!(deployment.status.as_str(), "running");

    let (status, body) = call(&app, Method::GET, &format!("/deployments/{}", deployment_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["trigger"]["kind"], "deploy");

    let (status, body) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/deployments/{}/replicas", deployment_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["replica_index"], 0);

    let (status, body) = call(&app, Method::GET, "/images/referenced", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([deployment.image_name.unwrap()]));

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/deployments/{}/stop", deployment_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
}

#[tokio::test]
async fn test_error_mapping() {
    let h = harness();
    let app = app(&h);

    let (status, body) = call(&app, Method::GET, "/deployments/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, _) = call(&app, Method::POST, "/services/missing/deployments", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let service = h
        .orchestrator
        .create_service(database_service("db"))
        .await
        .unwrap();
    let (status, body) = call(
        &app,
        Method::PATCH,
        &format!("/services/{}", service.id),
        Some(json!({ "replica_count": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let web = h
        .orchestrator
        .create_service(image_service("web", 1))
        .await
        .unwrap();
    let deployment = deploy_running(&h.orchestrator, &web.id).await;
    h.runtime.remove_image("ghcr.io/acme/web:1.0");
    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/deployments/{}/rollback", deployment.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["kind"], "image_gone");

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/deployments/{}/cancel", deployment.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_domain_routes() {
    let h = harness();
    let app = app(&h);
    let service = h
        .orchestrator
        .create_service(image_service("web", 1))
        .await
        .unwrap();

    let (status, domain) = call(
        &app,
        Method::POST,
        "/domains",
        Some(json!({
            "service_id": service.id,
            "domain": "shop.example.com",
            "type": "proxy"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let domain_id = domain["id"].as_str().unwrap().to_string();

    // Resolves nowhere
    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/domains/{}/verify", domain_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::DELETE, &format!("/domains/{}", domain_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::DELETE, &format!("/domains/{}", domain_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_build_log_stream_of_finished_deployment() {
    let h = harness();
    let app = app(&h);
    let service = h
        .orchestrator
        .create_service(image_service("web", 1))
        .await
        .unwrap();
    let deployment = deploy_running(&h.orchestrator, &service.id).await;

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/deployments/{}/logs", deployment.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("data: {\"line\":\"==> deploying\"}"));
    assert!(text.contains("event: end\ndata: {\"status\":\"running\"}"));
}
