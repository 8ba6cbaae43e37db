//! HTTPS front-end backed by a locally generated CA

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{FrontendLauncher, SecuredFrontend};
use crate::bootstrap::datadir::DataDir;
use crate::config::TlsConfig;
use crate::pki::CertificateAuthority;
use crate::{Error, Result};

/// Subdirectory of the data directory holding the CA
pub const TLS_SUBDIR: &str = "tls";

const CA_COMMON_NAME: &str = "lattice-server-ca";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Launches [`TlsFrontend`]
///
/// The listening socket is bound synchronously so a busy port fails the
/// bootstrap. CA generation and TLS setup continue in the background; until
/// they finish the front-end reports its CA as not ready.
#[derive(Debug, Default, Clone)]
pub struct TlsFrontendLauncher;

impl TlsFrontendLauncher {
    /// Create a new launcher
    pub fn new() -> Self {
        Self
    }
}

/// A running HTTPS front-end
#[derive(Debug, Default)]
pub struct TlsFrontend {
    ca: OnceLock<std::result::Result<String, String>>,
}

impl SecuredFrontend for TlsFrontend {
    fn ca_cert(&self) -> Result<String> {
        match self.ca.get() {
            Some(Ok(pem)) => Ok(pem.clone()),
            Some(Err(msg)) => Err(Error::pki(msg.clone())),
            None => Err(Error::ca_not_ready("waiting to generate CA certs")),
        }
    }
}

fn serving_sans(config: &TlsConfig) -> Vec<String> {
    let mut sans = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    for san in &config.sans {
        if !sans.contains(san) {
            sans.push(san.clone());
        }
    }
    sans
}

#[async_trait]
impl FrontendLauncher for TlsFrontendLauncher {
    async fn start(
        &self,
        cancel: CancellationToken,
        handler: Router,
        config: &TlsConfig,
        data_dir: &DataDir,
    ) -> Result<Arc<dyn SecuredFrontend>> {
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.https_port)
            .parse()
            .map_err(|e| Error::frontend(format!("invalid listen address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .map_err(|e| Error::frontend(format!("failed to bind {}: {}", addr, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::frontend(format!("failed to configure listener: {}", e)))?;

        let frontend = Arc::new(TlsFrontend::default());
        let tls_dir = data_dir.join(TLS_SUBDIR);
        let sans = serving_sans(config);

        let state = frontend.clone();
        tokio::spawn(async move {
            let generated = tokio::task::spawn_blocking(move || {
                let ca = CertificateAuthority::load_or_create(&tls_dir, CA_COMMON_NAME)?;
                let san_refs: Vec<&str> = sans.iter().map(String::as_str).collect();
                let (cert, key) = ca.generate_server_cert(&san_refs)?;
                Ok::<_, Error>((ca, cert, key))
            })
            .await;

            let (ca, cert, key) = match generated {
                Ok(Ok(parts)) => parts,
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to prepare server certificates");
                    let _ = state.ca.set(Err(e.to_string()));
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Certificate generation task failed");
                    let _ = state.ca.set(Err(e.to_string()));
                    return;
                }
            };

            let tls_config =
                match RustlsConfig::from_pem(cert.into_bytes(), key.into_bytes()).await {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "Failed to build TLS config");
                        let _ = state.ca.set(Err(format!("TLS config error: {}", e)));
                        return;
                    }
                };

            let handle = Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });

            let _ = state.ca.set(Ok(ca.ca_cert_pem().to_string()));
            info!(addr = %addr, "Starting HTTPS server");

            if let Err(e) = axum_server::from_tcp_rustls(listener, tls_config)
                .handle(handle)
                .serve(handler.into_make_service())
                .await
            {
                error!(error = %e, "HTTPS server error");
            }
        });

        Ok(frontend)
    }
}
