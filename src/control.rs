//! Control plane collaborator
//!
//! The bootstrap treats the control plane as a black box: start it, get back
//! the runtime secrets it was started with. [`ProcessControlPlane`] runs the
//! configured command as a child process and supervises it until the
//! bootstrap's cancellation token fires.

use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bootstrap::token::generate_secret;
use crate::config::ControlConfig;
use crate::{Error, Result};

/// Secrets the control plane was started with
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ControlRuntime {
    /// Raw secret nodes present to join the cluster
    pub node_token: String,
    /// Raw secret the local admin client authenticates with
    pub client_token: String,
}

impl std::fmt::Debug for ControlRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRuntime")
            .field("node_token_set", &!self.node_token.is_empty())
            .field("client_token_set", &!self.client_token.is_empty())
            .finish()
    }
}

/// Starts the backing control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Start the control plane; returns once it is running in the background
    async fn start(&self, cancel: CancellationToken, config: &ControlConfig)
        -> Result<ControlRuntime>;
}

/// Control plane run as a supervised child process
///
/// Node and client secrets are taken from configuration or generated, and
/// handed to the child through `LATTICE_NODE_TOKEN` / `LATTICE_CLIENT_TOKEN`.
/// With an empty command no process is started; only the secrets are issued.
#[derive(Debug, Default, Clone)]
pub struct ProcessControlPlane;

impl ProcessControlPlane {
    /// Create a new process-backed control plane
    pub fn new() -> Self {
        Self
    }
}

/// Resolve the runtime secrets for a control plane start
pub fn runtime_secrets(config: &ControlConfig) -> ControlRuntime {
    ControlRuntime {
        node_token: config
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(generate_secret),
        client_token: generate_secret(),
    }
}

#[async_trait]
impl ControlPlane for ProcessControlPlane {
    async fn start(
        &self,
        cancel: CancellationToken,
        config: &ControlConfig,
    ) -> Result<ControlRuntime> {
        let runtime = runtime_secrets(config);

        let Some((program, args)) = config.control_plane_command.split_first() else {
            warn!("No control plane command configured, running front-end only");
            return Ok(runtime);
        };

        let mut child = Command::new(program)
            .args(args)
            .env("LATTICE_NODE_TOKEN", &runtime.node_token)
            .env("LATTICE_CLIENT_TOKEN", &runtime.client_token)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::control_plane(format!("failed to spawn {}: {}", program, e)))?;

        // A command that exits straight away never came up.
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::control_plane(format!("failed to poll {}: {}", program, e)))?
        {
            return Err(Error::control_plane(format!(
                "{} exited immediately with {}",
                program, status
            )));
        }

        info!(command = %program, pid = ?child.id(), "Started control plane");

        let program = program.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => error!(command = %program, %status, "Control plane exited"),
                    Err(e) => error!(command = %program, error = %e, "Failed to wait for control plane"),
                },
                _ = cancel.cancelled() => {
                    info!(command = %program, "Stopping control plane");
                    if let Err(e) = child.kill().await {
                        warn!(command = %program, error = %e, "Failed to stop control plane");
                    }
                }
            }
        });

        Ok(runtime)
    }
}
