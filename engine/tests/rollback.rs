mod common;

use common::*;
use frost_engine::errors::EngineError;
use frost_engine::models::{DeploymentStatus, DeploymentTrigger, ServiceSettingsUpdate};
use frost_engine::store::Store;

#[tokio::test]
async fn test_rollback_redeploys_snapshot_without_touching_target() {
    let h = harness();
    let service = h
        .orchestrator
        .create_service(image_service("web", 2))
        .await
        .unwrap();
    let v1 = deploy_running(&h.orchestrator, &service.id).await;

    h.orchestrator
        .update_service_settings(
            &service.id,
            ServiceSettingsUpdate {
                image_url: Some("ghcr.io/acme/web:2.0".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let v2 = deploy_running(&h.orchestrator, &service.id).await;
    assert_eq!(v2.image_name.as_deref(), Some("ghcr.io/acme/web:2.0"));
    let pulls_before = h
        .journal
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Pull { .. }))
        .count();

    let target_before = h.store.get_deployment(&v1.id).await.unwrap().unwrap();

    let mut rollbacks = Vec::new();
    for _ in 0..2 {
        let admitted = h.orchestrator.rollback(&v1.id).await.unwrap();
        let settled = wait_settled(&h.orchestrator, &admitted.id).await;
        assert_eq!(settled.status, DeploymentStatus::Running);
        rollbacks.push(settled);
    }

    assert_ne!(rollbacks[0].id, rollbacks[1].id);
    for rollback in &rollbacks {
        assert_eq!(
            rollback.trigger,
            DeploymentTrigger::Rollback {
                from_deployment_id: v1.id.clone()
            }
        );
        assert_eq!(rollback.image_name, v1.image_name);
        assert!(!rollback.build_log.contains("==> building"));
        assert!(!rollback.build_log.contains("==> cloning"));
    }

    // Snapshots are redeployed from the local store
    let pulls_after = h
        .journal
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Pull { .. }))
        .count();
    assert_eq!(pulls_after, pulls_before);

    let target_after = h.store.get_deployment(&v1.id).await.unwrap().unwrap();
    assert_eq!(target_after.status, target_before.status);
    assert_eq!(target_after.build_log, target_before.build_log);
    assert_eq!(target_after.image_name, target_before.image_name);

    let stored = h.store.get_service(&service.id).await.unwrap().unwrap();
    assert_eq!(
        stored.current_deployment_id.as_deref(),
        Some(rollbacks[1].id.as_str())
    );
    assert_eq!(h.orchestrator.list_deployments(&service.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_rollback_copies_commit_of_target() {
    let h = harness();
    let service = h
        .orchestrator
        .create_service(repo_service("web"))
        .await
        .unwrap();
    let v1 = deploy_running(&h.orchestrator, &service.id).await;
    deploy_running(&h.orchestrator, &service.id).await;

    let rollback = h.orchestrator.rollback(&v1.id).await.unwrap();
    assert_eq!(rollback.commit_sha, v1.commit_sha);
    assert_eq!(rollback.commit_message, v1.commit_message);

    let rollback = wait_settled(&h.orchestrator, &rollback.id).await;
    assert_eq!(rollback.status, DeploymentStatus::Running);
    assert_eq!(
        h.journal
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Build { .. }))
            .count(),
        2
    );
}

#[tokio::test]
async fn test_rollback_needs_image_snapshot() {
    let h = harness();
    let service = h
        .orchestrator
        .create_service(repo_service("web"))
        .await
        .unwrap();
    h.runtime.set_build_fails(true);
    let failed = h.orchestrator.create_deployment(&service.id).await.unwrap();
    let failed = wait_settled(&h.orchestrator, &failed.id).await;
    assert!(failed.image_name.is_none());

    let err = h.orchestrator.rollback(&failed.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.orchestrator.list_deployments(&service.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rollback_refuses_volume_services() {
    let h = harness();
    let service = h
        .orchestrator
        .create_service(database_service("db"))
        .await
        .unwrap();
    let v1 = deploy_running(&h.orchestrator, &service.id).await;

    let err = h.orchestrator.rollback(&v1.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.orchestrator.list_deployments(&service.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rollback_to_pruned_image() {
    let h = harness();
    let service = h
        .orchestrator
        .create_service(image_service("web", 1))
        .await
        .unwrap();
    let v1 = deploy_running(&h.orchestrator, &service.id).await;
    h.runtime.remove_image("ghcr.io/acme/web:1.0");

    let err = h.orchestrator.rollback(&v1.id).await.unwrap_err();
    assert!(matches!(err, EngineError::ImageGone(_)));
    assert_eq!(err.kind(), "image_gone");
    assert_eq!(h.orchestrator.list_deployments(&service.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rollback_of_unknown_deployment() {
    let h = harness();
    let err = h.orchestrator.rollback("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}
