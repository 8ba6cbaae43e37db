//! Integration tests for the Lattice server
//!
//! # Test Organization
//!
//! - `bootstrap_flow`: Stories about a server coming up from an empty data
//!   directory and what it leaves on disk for operators and joining nodes
//!
//! - `manifests`: Stories about addon manifests being staged and applied
//!   after the front-end starts

mod bootstrap_flow;
mod manifests;

use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use lattice_server::bootstrap::address::InterfaceProbe;
use lattice_server::bootstrap::datadir::{DataDirDefaults, Privilege};
use lattice_server::config::ServerConfig;
use lattice_server::control::ProcessControlPlane;
use lattice_server::deploy::{FileManifestDeployer, ManifestApplier};
use lattice_server::frontend::TlsFrontendLauncher;
use lattice_server::Collaborators;

static CWD_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests that chdir, starting each from the crate root
pub fn lock_cwd() -> MutexGuard<'static, ()> {
    let guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    std::env::set_current_dir(env!("CARGO_MANIFEST_DIR")).unwrap();
    guard
}

/// Install the process-wide TLS provider once
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Probe that always reports the same address
pub struct FixedProbe(pub IpAddr);

impl InterfaceProbe for FixedProbe {
    fn discover(&self) -> std::io::Result<IpAddr> {
        Ok(self.0)
    }
}

/// Applier that records every manifest it is handed
#[derive(Default)]
pub struct RecordingApplier {
    pub applied: Mutex<Vec<String>>,
}

#[async_trait]
impl ManifestApplier for RecordingApplier {
    async fn apply(&self, manifest: &str) -> lattice_server::Result<()> {
        self.applied.lock().unwrap().push(manifest.to_string());
        Ok(())
    }
}

/// Configuration rooted in a temp directory, listening on a free loopback port
pub fn test_config(root: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.control.data_dir = Some(root.join("data"));
    config.control.kubeconfig_output = Some(root.join("kube").join("config.yaml"));
    config.control.token = Some("integration-secret".to_string());
    config.tls.https_port = free_port();
    config.tls.bind_address = "127.0.0.1".to_string();
    config.poll.interval = Duration::from_millis(20);
    config
}

/// The server directory inside a test root
pub fn server_dir(root: &Path) -> PathBuf {
    root.join("data").join("server")
}

/// Real collaborators with a recording applier and a fixed advertise address
pub fn collaborators(applier: Arc<RecordingApplier>) -> Collaborators {
    Collaborators {
        control: Arc::new(ProcessControlPlane::new()),
        frontend: Arc::new(TlsFrontendLauncher::new()),
        deployer: Arc::new(
            FileManifestDeployer::new(applier).with_interval(Duration::from_millis(20)),
        ),
        probe: Arc::new(FixedProbe(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))),
        privilege: Privilege::User,
        data_dir_defaults: DataDirDefaults::default(),
    }
}
