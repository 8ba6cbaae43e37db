//! Lattice Server - single-node control-plane bootstrap
//!
//! Brings up the backing control plane, exposes the secured management
//! endpoint, derives join credentials bound to the server CA, and persists
//! client configuration so other nodes and local tooling can connect.
//!
//! # Bootstrap Order
//!
//! 1. Prepare the data directory and chdir into it
//! 2. Start the control plane
//! 3. Start the HTTPS front-end (and stage/watch addon manifests)
//! 4. Wait for the front-end CA to exist
//! 5. Issue credentials: node token, kubeconfig, join instructions
//!
//! # Modules
//!
//! - [`bootstrap`] - Bootstrap sequencing, data directory, tokens, advertise address
//! - [`control`] - Control-plane collaborator
//! - [`frontend`] - HTTPS front-end, request router, CA lookup cell
//! - [`deploy`] - Addon manifest staging and watching
//! - [`kubeconfig`] - Local kubeconfig writer
//! - [`pki`] - Certificate authority operations
//! - [`config`] - Server configuration and CLI arguments
//! - [`error`] - Error types for the server

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod control;
pub mod deploy;
pub mod error;
pub mod frontend;
pub mod kubeconfig;
pub mod pki;

pub use bootstrap::{start_server, BootstrapPhase, Collaborators};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port for the secured HTTPS front-end
pub const DEFAULT_HTTPS_PORT: u16 = 6443;

/// Product name used in operator-facing instructions
pub const DEFAULT_PRODUCT_NAME: &str = "lattice";

/// System-wide data directory used when running as root
pub const SYSTEM_DATA_DIR: &str = "/var/lib/lattice";

/// Per-user data directory used when running unprivileged
pub const USER_DATA_DIR: &str = "${HOME}/.lattice";

/// Subdirectory of the data directory owned by the server
pub const SERVER_SUBDIR: &str = "server";
