//! Stories about addon manifests

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use lattice_server::deploy::MANIFESTS_SUBDIR;
use lattice_server::start_server;

use super::*;

async fn wait_for_applied(applier: &RecordingApplier, count: usize) -> Vec<String> {
    for _ in 0..100 {
        {
            let applied = applier.applied.lock().unwrap();
            if applied.len() >= count {
                return applied.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    applier.applied.lock().unwrap().clone()
}

// =============================================================================
// Story: Bundled addons are applied after boot
// =============================================================================

#[tokio::test]
async fn story_bundled_namespace_is_staged_and_applied() {
    let _cwd = lock_cwd();
    install_crypto_provider();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let applier = Arc::new(RecordingApplier::default());
    let cancel = CancellationToken::new();

    start_server(cancel.clone(), &config, &collaborators(applier.clone()))
        .await
        .unwrap();

    let manifests = server_dir(root.path()).join(MANIFESTS_SUBDIR);
    assert!(manifests.join("lattice-system.yaml").exists());

    let applied = wait_for_applied(&applier, 1).await;
    cancel.cancel();

    assert!(applied.iter().any(|m| m.contains("name: lattice-system")));
}

// =============================================================================
// Story: Operators can opt out of a bundled addon
// =============================================================================

#[tokio::test]
async fn story_no_deploy_suppresses_bundled_manifest() {
    let _cwd = lock_cwd();
    install_crypto_provider();
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.control.skips = vec!["lattice-system".to_string()];
    let applier = Arc::new(RecordingApplier::default());
    let cancel = CancellationToken::new();

    start_server(cancel.clone(), &config, &collaborators(applier.clone()))
        .await
        .unwrap();

    // Drop in an operator manifest; only that one is applied
    let manifests = server_dir(root.path()).join(MANIFESTS_SUBDIR);
    std::fs::write(
        manifests.join("extra.yaml"),
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: extra\n  namespace: default\n",
    )
    .unwrap();

    let applied = wait_for_applied(&applier, 1).await;
    cancel.cancel();

    assert_eq!(applied.len(), 1);
    assert!(applied[0].contains("name: extra"));
}
