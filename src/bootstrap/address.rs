//! Advertise address selection
//!
//! Picks the address printed in join instructions. Only used for operator
//! output; the front-end binds its own sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::debug;

/// Loopback fallback when no routable interface is found
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

/// Discovers a routable local interface address
pub trait InterfaceProbe: Send + Sync {
    /// Return the preferred local address, or an error describing why none was found
    fn discover(&self) -> std::io::Result<IpAddr>;
}

/// Probe that asks the kernel which source address it would route from
///
/// Connecting a UDP socket sends no packets; it only selects a route, after
/// which the socket's local address is the interface that route uses.
#[derive(Debug, Clone)]
pub struct UdpRouteProbe {
    target: SocketAddr,
}

impl UdpRouteProbe {
    /// Probe toward a specific target address
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Default for UdpRouteProbe {
    fn default() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80))
    }
}

impl InterfaceProbe for UdpRouteProbe {
    fn discover(&self) -> std::io::Result<IpAddr> {
        let bind: SocketAddr = match self.target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(self.target)?;
        Ok(socket.local_addr()?.ip())
    }
}

/// Resolve the address to advertise, falling back to loopback
///
/// Never fails and never returns an empty string.
pub fn advertise_address(probe: &dyn InterfaceProbe) -> String {
    match probe.discover() {
        Ok(ip) if !ip.is_unspecified() && !ip.is_loopback() => ip.to_string(),
        Ok(ip) => {
            debug!(ip = %ip, "Interface probe returned a non-routable address, using loopback");
            LOOPBACK_ADDRESS.to_string()
        }
        Err(e) => {
            debug!(error = %e, "Interface discovery failed, using loopback");
            LOOPBACK_ADDRESS.to_string()
        }
    }
}
