//! Secured HTTPS front-end
//!
//! The front-end terminates TLS and serves the management routes. It owns the
//! server CA, which becomes available some time after the listener starts.
//!
//! The request router needs the CA too (`GET /cacerts`), but it has to be
//! built before the front-end exists. [`CaLookup`] breaks that cycle: the
//! router holds a lookup over a single-assignment cell, and the bootstrap
//! assigns the front-end into the cell once it has been launched.

mod router;
mod tls;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::Router;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::datadir::DataDir;
use crate::config::TlsConfig;
use crate::{Error, Result};

pub use router::router;
pub use tls::{TlsFrontend, TlsFrontendLauncher, TLS_SUBDIR};

/// A running secured front-end
#[cfg_attr(test, automock)]
pub trait SecuredFrontend: Send + Sync {
    /// PEM-encoded CA certificate
    ///
    /// Returns an error until the CA has been generated; once it succeeds the
    /// value is stable for the life of the process.
    fn ca_cert(&self) -> Result<String>;
}

/// Starts the secured front-end with a request router
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrontendLauncher: Send + Sync {
    /// Start serving `handler`; returns once the listener is running
    async fn start(
        &self,
        cancel: CancellationToken,
        handler: Router,
        config: &TlsConfig,
        data_dir: &DataDir,
    ) -> Result<Arc<dyn SecuredFrontend>>;
}

/// Late-bound access to the front-end CA
///
/// Cloning shares the same cell. Before [`CaLookup::assign`] every lookup
/// returns [`Error::CaNotReady`].
#[derive(Clone, Default)]
pub struct CaLookup {
    cell: Arc<OnceLock<Arc<dyn SecuredFrontend>>>,
}

impl CaLookup {
    /// Create an empty lookup
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the lookup to a running front-end
    ///
    /// Only the first assignment takes effect.
    pub fn assign(&self, frontend: Arc<dyn SecuredFrontend>) -> bool {
        self.cell.set(frontend).is_ok()
    }

    /// Fetch the CA through the assigned front-end
    pub fn ca_cert(&self) -> Result<String> {
        match self.cell.get() {
            Some(frontend) => frontend.ca_cert(),
            None => Err(Error::ca_not_ready("front-end not started")),
        }
    }
}

impl std::fmt::Debug for CaLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaLookup")
            .field("assigned", &self.cell.get().is_some())
            .finish()
    }
}
