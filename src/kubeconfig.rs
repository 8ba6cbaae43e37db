//! Local kubeconfig writer
//!
//! After the CA exists the server writes a kubeconfig that points local
//! tooling at `https://localhost:<port>`, trusts the server CA and
//! authenticates with the bound client token.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::bootstrap::datadir::DataDir;
use crate::bootstrap::token::write_private;
use crate::config::parse_file_mode;
use crate::{Error, Result};

/// Name used for the single cluster, user and context entries
pub const ENTRY_NAME: &str = "default";

/// Kubeconfig file name under `${HOME}/.kube`
pub const HOME_KUBECONFIG: &str = "lattice.yaml";

/// Kubeconfig file name under the data directory
pub const DATA_DIR_KUBECONFIG: &str = "kubeconfig-lattice.yaml";

/// Kubeconfig structure
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<KubeconfigCluster>,
    /// Users
    pub users: Vec<KubeconfigUser>,
    /// Contexts
    pub contexts: Vec<KubeconfigContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry in kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeconfigCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// User entry in kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeconfigUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// User configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct UserConfig {
    /// Bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Context entry in kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeconfigContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

impl Kubeconfig {
    /// Single-entry kubeconfig for the local server
    pub fn local(https_port: u16, ca_pem: &str, token: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![KubeconfigCluster {
                name: ENTRY_NAME.to_string(),
                cluster: ClusterConfig {
                    server: format!("https://localhost:{}", https_port),
                    certificate_authority_data: (!ca_pem.is_empty())
                        .then(|| STANDARD.encode(ca_pem)),
                },
            }],
            users: vec![KubeconfigUser {
                name: ENTRY_NAME.to_string(),
                user: UserConfig {
                    token: (!token.is_empty()).then(|| token.to_string()),
                },
            }],
            contexts: vec![KubeconfigContext {
                name: ENTRY_NAME.to_string(),
                context: ContextConfig {
                    cluster: ENTRY_NAME.to_string(),
                    user: ENTRY_NAME.to_string(),
                },
            }],
            current_context: ENTRY_NAME.to_string(),
        }
    }
}

/// Where the kubeconfig goes
///
/// An explicit path wins; otherwise `${HOME}/.kube/lattice.yaml`, and without a
/// home directory `<data-dir>/kubeconfig-lattice.yaml`. The flag is true when
/// the home default was chosen.
pub fn resolve_kubeconfig_path(
    explicit: Option<&Path>,
    home: Option<&Path>,
    data_dir: &DataDir,
) -> (PathBuf, bool) {
    if let Some(path) = explicit {
        return (path.to_path_buf(), false);
    }
    match home {
        Some(home) => (home.join(".kube").join(HOME_KUBECONFIG), true),
        None => (data_dir.join(DATA_DIR_KUBECONFIG), false),
    }
}

/// Write `kubeconfig` to `path`
///
/// The file is created owner-only. A configured `mode` is applied afterwards;
/// an unparseable mode or a failed chmod is logged and leaves the file 0600.
pub fn write_kubeconfig(path: &Path, kubeconfig: &Kubeconfig, mode: Option<&str>) -> Result<()> {
    let yaml = serde_yaml::to_string(kubeconfig)
        .map_err(|e| Error::config(format!("failed to serialize kubeconfig: {}", e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    write_private(path, yaml.as_bytes())?;

    if let Some(mode) = mode {
        match parse_file_mode(mode) {
            Ok(bits) => set_mode(path, mode, bits),
            Err(e) => error!(path = %path.display(), error = %e, "Ignoring kubeconfig mode"),
        }
    }

    info!(path = %path.display(), "Wrote kubeconfig");
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: &str, bits: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(bits)) {
        error!(path = %path.display(), mode = %mode, error = %e, "Failed to set kubeconfig mode");
    }
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: &str, _bits: u32) {
    error!(path = %path.display(), mode = %mode, "File modes are not supported on this platform");
}
