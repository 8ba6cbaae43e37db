//! Error types for the Lattice server
//!
//! Fatal bootstrap errors carry the [`BootstrapPhase`] they occurred in so the
//! caller sees which step of startup failed. Best-effort failures (token
//! files, kubeconfig) never become an [`Error`] returned from
//! [`crate::start_server`]; they are logged where they happen.

use std::path::PathBuf;

use thiserror::Error;

use crate::bootstrap::BootstrapPhase;

/// Main error type for Lattice server operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Data directory could not be resolved, created or entered
    #[error("data directory error [{step}] for {}: {message}", path.display())]
    DataDir {
        /// The directory being prepared
        path: PathBuf,
        /// Which step failed (resolve, mkdir, chdir)
        step: &'static str,
        /// Description of what failed
        message: String,
    },

    /// Control plane failed to start
    #[error("starting control plane: {message}")]
    ControlPlane {
        /// Description of what failed
        message: String,
    },

    /// Secured front-end failed to start
    #[error("starting tls server: {message}")]
    Frontend {
        /// Description of what failed
        message: String,
    },

    /// Addon manifest staging or watching failed
    #[error("deploying manifests from {}: {message}", path.display())]
    Deploy {
        /// Manifest directory
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API call failed
    #[error("kubernetes error: {0}")]
    Kube(String),

    /// Root-of-trust material is not available yet
    #[error("CA certificate not available: {0}")]
    CaNotReady(String),

    /// PKI operation failed
    #[error("pki error: {0}")]
    Pki(String),

    /// Configuration is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// File I/O error
    #[error("io error for {}: {source}", path.display())]
    Io {
        /// File being read or written
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A fatal bootstrap step failed with an error that names no phase itself
    #[error("{phase}: {source}")]
    Bootstrap {
        /// Phase that failed
        phase: BootstrapPhase,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },

    /// Bootstrap was cancelled before it completed
    #[error("bootstrap cancelled while {phase}")]
    Cancelled {
        /// Phase that observed the cancellation
        phase: BootstrapPhase,
    },
}

impl Error {
    /// Create a data directory error for the given step
    pub fn data_dir(
        path: impl Into<PathBuf>,
        step: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::DataDir {
            path: path.into(),
            step,
            message: message.into(),
        }
    }

    /// Create a control plane error with the given message
    pub fn control_plane(msg: impl Into<String>) -> Self {
        Self::ControlPlane {
            message: msg.into(),
        }
    }

    /// Create a front-end error with the given message
    pub fn frontend(msg: impl Into<String>) -> Self {
        Self::Frontend {
            message: msg.into(),
        }
    }

    /// Create a deploy error for the given manifest directory
    pub fn deploy(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Deploy {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a Kubernetes API error with the given message
    pub fn kube(msg: impl Into<String>) -> Self {
        Self::Kube(msg.into())
    }

    /// Create a CA-not-ready error
    pub fn ca_not_ready(msg: impl Into<String>) -> Self {
        Self::CaNotReady(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap an I/O error with the path it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is expected to clear on its own
    ///
    /// Only a missing CA is transient; every startup failure is fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CaNotReady(_))
    }

    /// Attribute this error to `phase`
    ///
    /// Errors that already belong to `phase` are returned unchanged; anything
    /// else is wrapped so the phase travels with it.
    pub fn in_phase(self, phase: BootstrapPhase) -> Self {
        if self.phase() == Some(phase) {
            return self;
        }
        Self::Bootstrap {
            phase,
            source: Box::new(self),
        }
    }

    /// Bootstrap phase a fatal error belongs to
    pub fn phase(&self) -> Option<BootstrapPhase> {
        match self {
            Self::DataDir { .. } => Some(BootstrapPhase::PreparingDir),
            Self::ControlPlane { .. } => Some(BootstrapPhase::StartingControlPlane),
            Self::Frontend { .. } | Self::Deploy { .. } => {
                Some(BootstrapPhase::StartingSecuredFrontend)
            }
            Self::Bootstrap { phase, .. } | Self::Cancelled { phase } => Some(*phase),
            _ => None,
        }
    }
}
