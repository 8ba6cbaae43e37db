//! Server bootstrap sequencing
//!
//! [`start_server`] brings a single-node server up in a fixed order:
//!
//! 1. Prepare the data directory (create 0700, chdir)
//! 2. Start the control plane
//! 3. Start the HTTPS front-end, then stage and watch addon manifests
//! 4. Poll the front-end until its CA exists
//! 5. Issue credentials: bound node token, join instructions, kubeconfig
//!
//! # Failure Model
//!
//! - Steps 1-3 are fatal: the error is returned and nothing later runs
//! - Step 4 retries a missing CA forever (or until `max_wait`), observing
//!   cancellation on every iteration
//! - Step 5 is best-effort: write failures are logged and the bootstrap
//!   still reports success
//!
//! # Token Binding
//!
//! Join tokens embed a SHA-256 digest of the CA PEM (`K10<hex>::<secret>`),
//! so a node holding a token can reject a server presenting a different CA.

pub mod address;
pub mod datadir;
pub mod token;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PollConfig, ServerConfig};
use crate::control::{ControlPlane, ControlRuntime};
use crate::deploy::{ManifestDeployer, MANIFESTS_SUBDIR};
use crate::frontend::{router, CaLookup, FrontendLauncher, SecuredFrontend};
use crate::kubeconfig::{resolve_kubeconfig_path, write_kubeconfig, Kubeconfig};
use crate::{Error, Result};

use address::{advertise_address, InterfaceProbe, UdpRouteProbe};
use datadir::{DataDir, DataDirDefaults, Privilege};
use token::{format_token, TokenStore, NODE_TOKEN_FILE};

/// Steps of the bootstrap, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// Resolving, creating and entering the data directory
    PreparingDir,
    /// Starting the control plane
    StartingControlPlane,
    /// Starting the HTTPS front-end and manifest deployer
    StartingSecuredFrontend,
    /// Polling for the front-end CA
    WaitingForRootOfTrust,
    /// Writing tokens and kubeconfig
    IssuingCredentials,
    /// Bootstrap finished
    Done,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PreparingDir => "preparing data directory",
            Self::StartingControlPlane => "starting control plane",
            Self::StartingSecuredFrontend => "starting secured front-end",
            Self::WaitingForRootOfTrust => "waiting for root of trust",
            Self::IssuingCredentials => "issuing credentials",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// External services the bootstrap drives
#[derive(Clone)]
pub struct Collaborators {
    /// Control plane launcher
    pub control: Arc<dyn ControlPlane>,
    /// HTTPS front-end launcher
    pub frontend: Arc<dyn FrontendLauncher>,
    /// Addon manifest deployer
    pub deployer: Arc<dyn ManifestDeployer>,
    /// Advertise address discovery
    pub probe: Arc<dyn InterfaceProbe>,
    /// Privilege used to pick the default data directory
    pub privilege: Privilege,
    /// Default data directories
    pub data_dir_defaults: DataDirDefaults,
}

impl Collaborators {
    /// Collaborators with the process privilege and default probe
    pub fn new(
        control: Arc<dyn ControlPlane>,
        frontend: Arc<dyn FrontendLauncher>,
        deployer: Arc<dyn ManifestDeployer>,
    ) -> Self {
        Self {
            control,
            frontend,
            deployer,
            probe: Arc::new(UdpRouteProbe::default()),
            privilege: Privilege::current(),
            data_dir_defaults: DataDirDefaults::default(),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("privilege", &self.privilege)
            .field("data_dir_defaults", &self.data_dir_defaults)
            .finish_non_exhaustive()
    }
}

fn enter(cancel: &CancellationToken, phase: BootstrapPhase) -> Result<BootstrapPhase> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled { phase });
    }
    debug!(phase = %phase, "Entering bootstrap phase");
    Ok(phase)
}

/// Bring the server up and return the CA PEM
///
/// Spawned services (control plane process, HTTPS listener, manifest
/// watcher) keep running after this returns, until `cancel` fires.
pub async fn start_server(
    cancel: CancellationToken,
    config: &ServerConfig,
    collaborators: &Collaborators,
) -> Result<String> {
    enter(&cancel, BootstrapPhase::PreparingDir)?;
    let data_dir = datadir::prepare(
        config.control.data_dir.as_deref(),
        collaborators.privilege,
        &collaborators.data_dir_defaults,
    )
    .map_err(|e| e.in_phase(BootstrapPhase::PreparingDir))?;

    enter(&cancel, BootstrapPhase::StartingControlPlane)?;
    let runtime = collaborators
        .control
        .start(cancel.clone(), &config.control)
        .await
        .map_err(|e| e.in_phase(BootstrapPhase::StartingControlPlane))?;

    enter(&cancel, BootstrapPhase::StartingSecuredFrontend)?;
    let frontend = start_frontend(&cancel, config, collaborators, &data_dir)
        .await
        .map_err(|e| e.in_phase(BootstrapPhase::StartingSecuredFrontend))?;

    let phase = enter(&cancel, BootstrapPhase::WaitingForRootOfTrust)?;
    let (ca, retries) = wait_for_root_of_trust(&cancel, frontend.as_ref(), &config.poll).await?;
    debug!(phase = %phase, retries, "Root of trust available");

    enter(&cancel, BootstrapPhase::IssuingCredentials)?;
    issue_credentials(config, &data_dir, &runtime, &ca, collaborators.probe.as_ref());

    info!(phase = %BootstrapPhase::Done, "Server bootstrap complete");
    Ok(ca)
}

/// Launch the front-end with a router whose CA lookup is bound afterwards,
/// then stage addon manifests and spawn their watcher
async fn start_frontend(
    cancel: &CancellationToken,
    config: &ServerConfig,
    collaborators: &Collaborators,
    data_dir: &DataDir,
) -> Result<Arc<dyn SecuredFrontend>> {
    let ca_lookup = CaLookup::new();
    let handler = router(ca_lookup.clone());

    let frontend = collaborators
        .frontend
        .start(cancel.clone(), handler, &config.tls, data_dir)
        .await?;
    ca_lookup.assign(frontend.clone());

    let manifests = data_dir.join(MANIFESTS_SUBDIR);
    collaborators.deployer.stage(&manifests)?;

    let deployer = collaborators.deployer.clone();
    let skips = config.control.skips.clone();
    let watch_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = deployer.watch(watch_cancel, skips, manifests).await {
            error!(error = %e, "Manifest watcher failed");
        }
    });

    Ok(frontend)
}

/// Poll `frontend` until its CA is available
///
/// Returns the CA and how many times the poll had to wait.
pub async fn wait_for_root_of_trust(
    cancel: &CancellationToken,
    frontend: &dyn SecuredFrontend,
    poll: &PollConfig,
) -> Result<(String, u32)> {
    let start = Instant::now();
    let mut retries = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                phase: BootstrapPhase::WaitingForRootOfTrust,
            });
        }

        match frontend.ca_cert() {
            Ok(ca) => return Ok((ca, retries)),
            Err(e) => {
                info!(error = %e, "Waiting to generate CA certs");
                if let Some(max_wait) = poll.max_wait {
                    if start.elapsed() >= max_wait {
                        return Err(Error::ca_not_ready(format!(
                            "gave up after {:?}: {}",
                            max_wait, e
                        ))
                        .in_phase(BootstrapPhase::WaitingForRootOfTrust));
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled {
                    phase: BootstrapPhase::WaitingForRootOfTrust,
                });
            }
            _ = tokio::time::sleep(poll.interval) => {}
        }
        retries += 1;
    }
}

/// Operator instructions for joining another node
pub fn join_instructions(product: &str, address: &str, port: u16) -> String {
    let host = match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
        _ => address.to_string(),
    };
    format!(
        "To join node to cluster: {} agent -s https://{}:{} -t ${{NODE_TOKEN}}",
        product, host, port
    )
}

fn issue_credentials(
    config: &ServerConfig,
    data_dir: &DataDir,
    runtime: &ControlRuntime,
    ca: &str,
    probe: &dyn InterfaceProbe,
) {
    let node_token = format_token(&runtime.node_token, ca);
    let token_path = data_dir.join(NODE_TOKEN_FILE);
    // Join instructions point at the token file, so only print them once it exists.
    match TokenStore::persist(&node_token, &token_path) {
        Ok(()) if node_token.is_empty() => warn!("No node secret issued, node token not written"),
        Ok(()) => {
            info!(path = %token_path.display(), "Node token is available");
            let address = advertise_address(probe);
            info!(
                "{}",
                join_instructions(&config.control.product_name, &address, config.tls.https_port)
            );
        }
        Err(e) => error!(path = %token_path.display(), error = %e, "Failed to write node token"),
    }

    let client_token = format_token(&runtime.client_token, ca);
    let home = dirs::home_dir();
    let (path, is_home_default) = resolve_kubeconfig_path(
        config.control.kubeconfig_output.as_deref(),
        home.as_deref(),
        data_dir,
    );
    let kubeconfig = Kubeconfig::local(config.tls.https_port, ca, &client_token);
    match write_kubeconfig(&path, &kubeconfig, config.control.kubeconfig_mode.as_deref()) {
        Ok(()) if is_home_default => {
            info!("Run: {} kubectl", config.control.product_name)
        }
        Ok(()) => {}
        Err(e) => error!(path = %path.display(), error = %e, "Failed to write kubeconfig"),
    }
}
