//! Boundary to the tunnel client library.
//! The supervisor and the utility commands only see this trait; the wire
//! protocol lives behind it.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::config::{RuntimeConfig, TransportKind};

/// Parameters of a single client connection to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub endpoint: String,
    pub auth_key: String,
    pub transport: TransportKind,
    pub proxy_url: Option<String>,
    pub disconnect_timeout: Duration,
}

impl ClientOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            endpoint: config.server_addr.clone(),
            auth_key: config.vkey.clone(),
            transport: config.transport,
            proxy_url: config.proxy_url.clone(),
            disconnect_timeout: config.disconnect_timeout,
        }
    }
}

/// A one-shot local relay towards a peer reached with a shared password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRelayConfig {
    pub password: String,
    pub target: String,
    pub local_type: String,
    pub local_port: u16,
    pub server: ClientOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    OpenInternet,
    FullCone,
    Restricted,
    PortRestricted,
    Symmetric,
    SymmetricUdpFirewall,
}

impl fmt::Display for NatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NatKind::OpenInternet => "Not behind a NAT",
            NatKind::FullCone => "Full cone NAT",
            NatKind::Restricted => "Restricted NAT",
            NatKind::PortRestricted => "Port restricted NAT",
            NatKind::Symmetric => "Symmetric NAT",
            NatKind::SymmetricUdpFirewall => "Symmetric UDP firewall",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatReport {
    pub kind: NatKind,
    pub public_endpoint: std::net::SocketAddr,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport {0} is not supported by this client")]
    UnsupportedTransport(TransportKind),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("no traffic from the server for {0:?}")]
    Timeout(Duration),
    #[error("tunnel file {path}: {reason}")]
    TunnelFile { path: String, reason: String },
    #[error("stun: {0}")]
    Stun(String),
}

/// Operations provided by the tunnel client library.
pub trait TunnelClient: Send + Sync + 'static {
    /// Connect and serve until the connection is lost.
    fn start_client(&self, options: &ClientOptions) -> Result<(), ClientError>;

    /// Run the local peer relay server.
    fn start_peer_relay(&self, relay: &PeerRelayConfig) -> Result<(), ClientError>;

    /// Run every tunnel described by a tunnel file until terminated.
    fn start_from_config_file(&self, path: &Path) -> Result<(), ClientError>;

    /// Print the state of the tunnels described by a tunnel file.
    fn query_status(&self, path: &Path) -> Result<(), ClientError>;

    /// Register this host's address with the server for `hours`.
    fn register_endpoint(&self, options: &ClientOptions, hours: u32) -> Result<(), ClientError>;

    fn discover_nat(&self, stun_addr: &str) -> Result<NatReport, ClientError>;
}
