//! SOCKS5 dialing for the control connection.

use std::net::TcpStream;

use log::debug;
use npc_core::client::ClientError;
use socks::Socks5Stream;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    pub address: String,
    pub credentials: Option<(String, String)>,
}

impl ProxyUrl {
    /// Accepts `socks5://[user:pass@]host:port`; the port defaults to 1080.
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let url = Url::parse(raw).map_err(|err| ClientError::Proxy(format!("{raw}: {err}")))?;
        if url.scheme() != "socks5" {
            return Err(ClientError::Proxy(format!(
                "unsupported proxy scheme {:?}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::Proxy(format!("{raw}: missing host")))?;
        let address = format!("{}:{}", host, url.port().unwrap_or(1080));
        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            ))
        };
        Ok(ProxyUrl {
            address,
            credentials,
        })
    }
}

/// Open a TCP stream to `target` (`host:port`) through the proxy.
pub fn connect(proxy: &ProxyUrl, target: &str) -> Result<TcpStream, ClientError> {
    debug!("dialing {} via socks5 proxy {}", target, proxy.address);
    let stream = match &proxy.credentials {
        Some((user, pass)) => {
            Socks5Stream::connect_with_password(proxy.address.as_str(), target, user, pass)
        }
        None => Socks5Stream::connect(proxy.address.as_str(), target),
    }
    .map_err(|err| ClientError::Proxy(format!("{} via {}: {}", target, proxy.address, err)))?;
    Ok(stream.into_inner())
}
