//! Server configuration
//!
//! [`ServerConfig`] is split the same way the bootstrap is: [`ControlConfig`]
//! drives the data directory, control plane and credential artifacts, while
//! [`TlsConfig`] drives the HTTPS front-end. Both are populated from
//! [`ServerArgs`] on the command line (with `LATTICE_*` environment
//! fallbacks) or built directly in tests.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::{Error, Result, DEFAULT_HTTPS_PORT, DEFAULT_PRODUCT_NAME};

/// Complete configuration for one `start_server` call
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// Control plane and credential settings
    pub control: ControlConfig,
    /// HTTPS front-end settings
    pub tls: TlsConfig,
    /// Root-of-trust polling behaviour
    pub poll: PollConfig,
}

/// Control plane, data directory and credential settings
#[derive(Clone, Debug)]
pub struct ControlConfig {
    /// Configured data directory; `None` selects the privilege-dependent default
    pub data_dir: Option<PathBuf>,
    /// Pre-shared node-join secret; generated when absent
    pub token: Option<String>,
    /// Explicit kubeconfig output path
    pub kubeconfig_output: Option<PathBuf>,
    /// Octal file mode applied to the kubeconfig after writing (e.g. "644")
    pub kubeconfig_mode: Option<String>,
    /// Addon manifests the watcher never applies
    pub skips: Vec<String>,
    /// Control plane command line; empty runs without a managed process
    pub control_plane_command: Vec<String>,
    /// Product name printed in join instructions
    pub product_name: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            token: None,
            kubeconfig_output: None,
            kubeconfig_mode: None,
            skips: Vec::new(),
            control_plane_command: Vec::new(),
            product_name: DEFAULT_PRODUCT_NAME.to_string(),
        }
    }
}

/// HTTPS front-end settings
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Port the front-end listens on
    pub https_port: u16,
    /// Address the front-end binds to
    pub bind_address: String,
    /// Extra subject alternative names for the serving certificate
    pub sans: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            https_port: DEFAULT_HTTPS_PORT,
            bind_address: "0.0.0.0".to_string(),
            sans: Vec::new(),
        }
    }
}

/// How the bootstrap waits for the front-end CA
///
/// The default waits forever. Giving up would leave the process half
/// started, so `max_wait` is opt-in only.
#[derive(Clone, Debug)]
pub struct PollConfig {
    /// Delay between attempts
    pub interval: Duration,
    /// Optional upper bound on the total wait (`None` = wait forever)
    pub max_wait: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_wait: None,
        }
    }
}

/// Parse an octal file mode such as `"644"` or `"0600"`
pub fn parse_file_mode(mode: &str) -> Result<u32> {
    let trimmed = mode.trim();
    let parsed = u32::from_str_radix(trimmed, 8)
        .map_err(|e| Error::config(format!("invalid file mode {:?}: {}", mode, e)))?;
    if parsed > 0o7777 {
        return Err(Error::config(format!("file mode {:?} out of range", mode)));
    }
    Ok(parsed)
}

// =============================================================================
// Command line
// =============================================================================

/// Run the single-node server
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Folder to hold state (default /var/lib/lattice or ${HOME}/.lattice if not root)
    #[arg(short = 'd', long, env = "LATTICE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// HTTPS listen port
    #[arg(long, env = "LATTICE_HTTPS_PORT", default_value_t = DEFAULT_HTTPS_PORT)]
    pub https_listen_port: u16,

    /// Address to bind the HTTPS listener to
    #[arg(long, env = "LATTICE_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Additional hostnames or IPs for the serving certificate
    #[arg(long = "tls-san", env = "LATTICE_TLS_SAN", value_delimiter = ',')]
    pub tls_san: Vec<String>,

    /// Shared secret used to join nodes to the cluster (generated if empty)
    #[arg(short = 't', long, env = "LATTICE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Write kubeconfig for the admin client to this file
    #[arg(short = 'o', long, env = "LATTICE_KUBECONFIG_OUTPUT")]
    pub write_kubeconfig: Option<PathBuf>,

    /// Write kubeconfig with this mode, e.g. 644
    #[arg(long, env = "LATTICE_KUBECONFIG_MODE")]
    pub write_kubeconfig_mode: Option<String>,

    /// Do not deploy the named packaged manifests
    #[arg(long = "no-deploy", value_delimiter = ',')]
    pub no_deploy: Vec<String>,

    /// Kubeconfig of the control plane API used to apply addon manifests
    /// (default: inferred from the environment)
    #[arg(long, env = "LATTICE_APPLY_KUBECONFIG")]
    pub apply_kubeconfig: Option<PathBuf>,

    /// Control plane command and arguments, e.g. `-- kube-apiserver --secure-port 6444`
    #[arg(last = true)]
    pub control_plane_command: Vec<String>,

    /// Seconds between root-of-trust polls
    #[arg(long, env = "LATTICE_CA_POLL_INTERVAL", default_value_t = 1)]
    pub ca_poll_interval_secs: u64,

    /// Give up waiting for the CA after this many seconds (default: wait forever)
    #[arg(long, env = "LATTICE_CA_MAX_WAIT")]
    pub ca_max_wait_secs: Option<u64>,
}

impl ServerArgs {
    /// Convert command line arguments into a [`ServerConfig`]
    pub fn into_config(self, product_name: impl Into<String>) -> Result<ServerConfig> {
        if self.ca_poll_interval_secs == 0 {
            return Err(Error::config("--ca-poll-interval-secs must be at least 1"));
        }

        Ok(ServerConfig {
            control: ControlConfig {
                data_dir: self.data_dir,
                token: self.token.filter(|t| !t.is_empty()),
                kubeconfig_output: self.write_kubeconfig,
                kubeconfig_mode: self.write_kubeconfig_mode,
                skips: self.no_deploy,
                control_plane_command: self.control_plane_command,
                product_name: product_name.into(),
            },
            tls: TlsConfig {
                https_port: self.https_listen_port,
                bind_address: self.bind_address,
                sans: self.tls_san,
            },
            poll: PollConfig {
                interval: Duration::from_secs(self.ca_poll_interval_secs),
                max_wait: self.ca_max_wait_secs.map(Duration::from_secs),
            },
        })
    }
}
