use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use frost_engine::deploy::{HealthProbe, HttpProbe, ProbeTarget};
use tokio::net::TcpListener;

async fn spawn_app() -> u16 {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/broken",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "starting") }),
        )
        .route(
            "/moved",
            get(|| async { (StatusCode::FOUND, [("location", "/health")]) }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn test_http_probe_requires_2xx() {
    let port = spawn_app().await;
    let probe = HttpProbe::new(Duration::from_secs(2));
    let target = ProbeTarget::HostPort(port);

    assert!(probe.probe(&target, Some("/health")).await);
    assert!(probe.probe(&target, Some("health")).await);
    assert!(!probe.probe(&target, Some("/broken")).await);
    assert!(!probe.probe(&target, Some("/missing")).await);
    // Redirects are not followed
    assert!(!probe.probe(&target, Some("/moved")).await);
}

#[tokio::test]
async fn test_tcp_probe_without_path() {
    let port = spawn_app().await;
    let probe = HttpProbe::new(Duration::from_secs(2));

    assert!(probe.probe(&ProbeTarget::HostPort(port), None).await);

    let closed = closed_port().await;
    assert!(!probe.probe(&ProbeTarget::HostPort(closed), None).await);
    assert!(!probe.probe(&ProbeTarget::HostPort(closed), Some("/health")).await);
}
