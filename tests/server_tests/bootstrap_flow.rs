//! Stories about a server coming up from an empty data directory

use std::net::TcpStream;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lattice_server::bootstrap::token::{format_token, parse_token, TokenStore, NODE_TOKEN_FILE};
use lattice_server::kubeconfig::Kubeconfig;
use lattice_server::pki::CA_CERT_FILE;
use lattice_server::{start_server, BootstrapPhase, Error};

use super::*;

// =============================================================================
// Story: First boot
// =============================================================================
//
// An operator starts the server against an empty directory. When start_server
// returns, the CA exists on disk, the node token is bound to it, and the admin
// kubeconfig trusts it.

#[tokio::test]
async fn story_first_boot_leaves_bound_credentials_on_disk() {
    let _cwd = lock_cwd();
    install_crypto_provider();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let cancel = CancellationToken::new();

    let ca = start_server(
        cancel.clone(),
        &config,
        &collaborators(Arc::new(RecordingApplier::default())),
    )
    .await
    .unwrap();

    let server_dir = server_dir(root.path());

    // The front-end persisted the CA it serves
    let on_disk = std::fs::read_to_string(server_dir.join("tls").join(CA_CERT_FILE)).unwrap();
    assert_eq!(on_disk, ca);

    // Joining nodes can check the server's CA against the token
    let token = TokenStore::read(&server_dir.join(NODE_TOKEN_FILE)).unwrap();
    assert_eq!(token, format_token("integration-secret", &ca));
    let parsed = parse_token(&token);
    assert_eq!(parsed.secret, "integration-secret");
    assert!(parsed.verify_ca(&ca));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(server_dir.join(NODE_TOKEN_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // The admin kubeconfig trusts the same CA
    let kubeconfig_path = config.control.kubeconfig_output.as_ref().unwrap();
    let kubeconfig: Kubeconfig =
        serde_yaml::from_str(&std::fs::read_to_string(kubeconfig_path).unwrap()).unwrap();
    assert_eq!(
        kubeconfig.clusters[0].cluster.server,
        format!("https://localhost:{}", config.tls.https_port)
    );
    let token = kubeconfig.users[0].user.token.as_deref().unwrap();
    assert!(parse_token(token).verify_ca(&ca));

    // The HTTPS listener is up
    assert!(TcpStream::connect(("127.0.0.1", config.tls.https_port)).is_ok());

    cancel.cancel();
}

// =============================================================================
// Story: Restart keeps the root of trust
// =============================================================================
//
// Tokens handed out before a restart must keep working, so the second boot
// reuses the CA from the data directory and issues the same node token.

#[tokio::test]
async fn story_restart_reissues_the_same_node_token() {
    let _cwd = lock_cwd();
    install_crypto_provider();
    let root = tempfile::tempdir().unwrap();

    let first_cancel = CancellationToken::new();
    let first_config = test_config(root.path());
    let first_ca = start_server(
        first_cancel.clone(),
        &first_config,
        &collaborators(Arc::new(RecordingApplier::default())),
    )
    .await
    .unwrap();
    let first_token = TokenStore::read(&server_dir(root.path()).join(NODE_TOKEN_FILE)).unwrap();
    first_cancel.cancel();

    let second_cancel = CancellationToken::new();
    let second_config = test_config(root.path());
    let second_ca = start_server(
        second_cancel.clone(),
        &second_config,
        &collaborators(Arc::new(RecordingApplier::default())),
    )
    .await
    .unwrap();
    let second_token =
        TokenStore::read(&server_dir(root.path()).join(NODE_TOKEN_FILE)).unwrap();
    second_cancel.cancel();

    assert_eq!(first_ca, second_ca);
    assert_eq!(first_token, second_token);
}

// =============================================================================
// Story: Port already taken
// =============================================================================

#[tokio::test]
async fn story_busy_port_fails_before_any_credentials_exist() {
    let _cwd = lock_cwd();
    install_crypto_provider();
    let root = tempfile::tempdir().unwrap();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = test_config(root.path());
    config.tls.https_port = taken.local_addr().unwrap().port();

    let err = start_server(
        CancellationToken::new(),
        &config,
        &collaborators(Arc::new(RecordingApplier::default())),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Frontend { .. }));
    assert_eq!(err.phase(), Some(BootstrapPhase::StartingSecuredFrontend));
    assert!(!server_dir(root.path()).join(NODE_TOKEN_FILE).exists());
    assert!(!config.control.kubeconfig_output.as_ref().unwrap().exists());
}
