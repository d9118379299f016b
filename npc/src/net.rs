//! TCP implementation of the tunnel client boundary.
//! Covers connection lifecycle only: dialing (optionally through SOCKS5), the
//! one-line hello, idle detection and byte piping for the peer relay.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::Local;
use log::{debug, info, warn};
use npc_core::client::{ClientError, ClientOptions, NatReport, PeerRelayConfig, TunnelClient};
use npc_core::config::TransportKind;
use npc_core::mode::{RECONNECT_DELAY, reconnect_loop};

use crate::socks::{self, ProxyUrl};
use crate::stun;
use crate::tunnel_file::TunnelFile;

const PROTOCOL_TAG: &str = "NPC";

#[derive(Debug, Default)]
pub struct NetClient;

impl NetClient {
    pub fn new() -> Self {
        Self
    }
}

/// Open the control connection described by `options`.
fn dial(options: &ClientOptions) -> Result<TcpStream, ClientError> {
    if options.transport == TransportKind::Kcp {
        return Err(ClientError::UnsupportedTransport(options.transport));
    }
    let stream = match &options.proxy_url {
        Some(url) => socks::connect(&ProxyUrl::parse(url)?, &options.endpoint)?,
        None => TcpStream::connect(&options.endpoint)?,
    };
    // A zero duration is rejected by the socket API; treat it as "no timeout".
    let timeout = Some(options.disconnect_timeout).filter(|t| !t.is_zero());
    stream.set_read_timeout(timeout)?;
    stream.set_nodelay(true)?;
    debug!("connected to {} over {}", options.endpoint, options.transport);
    Ok(stream)
}

fn hello(verb: &str, fields: &[&str]) -> String {
    let mut line = format!("{} {} {}", PROTOCOL_TAG, env!("CARGO_PKG_VERSION"), verb);
    for field in fields {
        line.push(' ');
        line.push_str(field);
    }
    line.push('\n');
    line
}

/// Read the one-line reply; anything but `ok` (case-insensitive, optional
/// trailing text) is a rejection.
fn expect_ok(reader: &mut impl BufRead, timeout: Duration) -> Result<String, ClientError> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|err| idle_error(err, timeout))?;
    if read == 0 {
        return Err(ClientError::Rejected("connection closed during handshake".to_string()));
    }
    let line = line.trim_end();
    let (status, rest) = line.split_once(' ').unwrap_or((line, ""));
    if status.eq_ignore_ascii_case("ok") {
        Ok(rest.to_string())
    } else {
        Err(ClientError::Rejected(line.to_string()))
    }
}

fn idle_error(err: io::Error, timeout: Duration) -> ClientError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => ClientError::Timeout(timeout),
        _ => ClientError::Io(err),
    }
}

/// Consume the stream until the peer closes it or it goes idle.
fn drain(reader: &mut impl Read, timeout: Duration) -> Result<(), ClientError> {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => debug!("received {} bytes from server", n),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(idle_error(err, timeout)),
        }
    }
}

/// Copy bytes both ways until either side closes.
fn pipe(local: TcpStream, remote: TcpStream) -> io::Result<()> {
    let mut local_read = local.try_clone()?;
    let mut remote_write = remote.try_clone()?;
    let upstream = thread::spawn(move || {
        let copied = io::copy(&mut local_read, &mut remote_write);
        let _ = remote_write.shutdown(Shutdown::Write);
        copied
    });

    let mut remote_read = remote;
    let mut local_write = local;
    let downstream = io::copy(&mut remote_read, &mut local_write);
    let _ = local_write.shutdown(Shutdown::Write);

    let upstream = upstream
        .join()
        .map_err(|_| io::Error::other("relay copy thread panicked"))?;
    debug!(
        "relay closed: {} bytes up, {} bytes down",
        upstream.unwrap_or(0),
        downstream.unwrap_or(0)
    );
    Ok(())
}

/// Accept local connections forever, bridging each to a server session.
fn serve_relay(listener: TcpListener, relay: &PeerRelayConfig) -> Result<(), ClientError> {
    for incoming in listener.incoming() {
        let local = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                warn!("peer relay accept failed: {}", err);
                continue;
            }
        };
        let relay = relay.clone();
        thread::spawn(move || {
            if let Err(err) = relay_session(local, &relay) {
                warn!("peer relay session to {} failed: {}", relay.target, err);
            }
        });
    }
    Ok(())
}

fn relay_session(local: TcpStream, relay: &PeerRelayConfig) -> Result<(), ClientError> {
    let mut remote = dial(&relay.server)?;
    remote.write_all(
        hello(
            "p2p",
            &[
                relay.password.as_str(),
                relay.target.as_str(),
                relay.local_type.as_str(),
            ],
        )
        .as_bytes(),
    )?;
    // Read the reply byte by byte so no payload is buffered away from the pipe.
    let mut reader = BufReader::with_capacity(1, remote.try_clone()?);
    expect_ok(&mut reader, relay.server.disconnect_timeout)?;
    remote.set_read_timeout(None)?;
    pipe(local, remote)?;
    Ok(())
}

impl TunnelClient for NetClient {
    fn start_client(&self, options: &ClientOptions) -> Result<(), ClientError> {
        let mut stream = dial(options)?;
        stream.write_all(hello("main", &[options.auth_key.as_str()]).as_bytes())?;
        let mut reader = BufReader::new(stream);
        expect_ok(&mut reader, options.disconnect_timeout)?;
        info!("connected to server {}", options.endpoint);
        drain(&mut reader, options.disconnect_timeout)
    }

    fn start_peer_relay(&self, relay: &PeerRelayConfig) -> Result<(), ClientError> {
        let listener = TcpListener::bind(("127.0.0.1", relay.local_port))?;
        info!(
            "peer relay listening on {}, target {} ({})",
            listener.local_addr()?,
            relay.target,
            relay.local_type
        );
        serve_relay(listener, relay)
    }

    fn start_from_config_file(&self, path: &Path) -> Result<(), ClientError> {
        let file = TunnelFile::load(path)?;
        let options = file.client_options();
        for (name, tunnel) in &file.tunnels {
            info!(
                "tunnel {}: {} server port {} -> {}",
                name, tunnel.mode, tunnel.server_port, tunnel.target_addr
            );
        }
        reconnect_loop(self, &options, RECONNECT_DELAY)
    }

    fn query_status(&self, path: &Path) -> Result<(), ClientError> {
        let file = TunnelFile::load(path)?;
        let options = file.client_options();
        let mut stream = dial(&options)?;
        stream.write_all(hello("status", &[options.auth_key.as_str()]).as_bytes())?;

        let mut reader = BufReader::new(stream);
        expect_ok(&mut reader, options.disconnect_timeout)?;
        let mut states = HashMap::new();
        for line in reader.lines() {
            let line = line.map_err(|err| idle_error(err, options.disconnect_timeout))?;
            if let Some((name, state)) = line.trim().split_once(' ') {
                states.insert(name.to_string(), state.trim().to_string());
            }
        }

        for (name, tunnel) in &file.tunnels {
            let state = states.get(name).map(String::as_str).unwrap_or("unknown");
            println!(
                "{}\t{}\t{} -> {}\t{}",
                name, tunnel.mode, tunnel.server_port, tunnel.target_addr, state
            );
        }
        Ok(())
    }

    fn register_endpoint(&self, options: &ClientOptions, hours: u32) -> Result<(), ClientError> {
        let mut stream = dial(options)?;
        let hours_field = hours.to_string();
        stream.write_all(
            hello("register", &[options.auth_key.as_str(), hours_field.as_str()]).as_bytes(),
        )?;
        let mut reader = BufReader::new(stream);
        expect_ok(&mut reader, options.disconnect_timeout)?;

        let expiry = Local::now() + chrono::Duration::hours(i64::from(hours));
        info!(
            "successful ip registration for local public network, valid until {}",
            expiry.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }

    fn discover_nat(&self, stun_addr: &str) -> Result<NatReport, ClientError> {
        stun::discover(stun_addr)
    }
}
