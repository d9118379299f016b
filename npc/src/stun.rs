//! NAT type discovery with STUN binding tests (RFC 3489 classification,
//! RFC 5389 message format).

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::debug;
use npc_core::client::{ClientError, NatKind, NatReport};
use rand::RngCore;

const MAGIC_COOKIE: u32 = 0x2112A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const CHANGE_IP: u32 = 0x04;
const CHANGE_PORT: u32 = 0x02;

const RECV_TIMEOUT: Duration = Duration::from_millis(1500);
const SENDS_PER_TEST: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingResponse {
    mapped: SocketAddr,
    alternate: Option<SocketAddr>,
}

/// Classify the NAT between this host and `server`.
pub fn discover(server: &str) -> Result<NatReport, ClientError> {
    let server_addr = resolve_server(server)?;
    let socket = UdpSocket::bind(unspecified(server_addr))?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;

    let first = binding(&socket, server_addr, 0)?
        .ok_or_else(|| ClientError::Stun("no response from stun server, udp blocked".into()))?;
    debug!("stun test I: mapped {}", first.mapped);

    let local = SocketAddr::new(local_ip_towards(server_addr)?, socket.local_addr()?.port());
    let changed_both = binding(&socket, server_addr, CHANGE_IP | CHANGE_PORT)?;
    debug!("stun test II answered: {}", changed_both.is_some());

    let kind = if first.mapped == local {
        if changed_both.is_some() {
            NatKind::OpenInternet
        } else {
            NatKind::SymmetricUdpFirewall
        }
    } else if changed_both.is_some() {
        NatKind::FullCone
    } else {
        let alternate = first.alternate.ok_or_else(|| {
            ClientError::Stun("stun server does not advertise an alternate address".into())
        })?;
        let again = binding(&socket, alternate, 0)?.ok_or_else(|| {
            ClientError::Stun(format!("no response from alternate address {alternate}"))
        })?;
        debug!("stun test I (alternate): mapped {}", again.mapped);
        if again.mapped != first.mapped {
            NatKind::Symmetric
        } else if binding(&socket, server_addr, CHANGE_PORT)?.is_some() {
            NatKind::Restricted
        } else {
            NatKind::PortRestricted
        }
    };

    Ok(NatReport {
        kind,
        public_endpoint: first.mapped,
    })
}

fn resolve_server(server: &str) -> Result<SocketAddr, ClientError> {
    server
        .to_socket_addrs()
        .map_err(|err| ClientError::Stun(format!("failed to resolve {server}: {err}")))?
        .next()
        .ok_or_else(|| ClientError::Stun(format!("{server} resolved to no addresses")))
}

fn unspecified(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Source address the kernel picks for traffic to `peer`.
fn local_ip_towards(peer: SocketAddr) -> Result<IpAddr, ClientError> {
    let probe = UdpSocket::bind(unspecified(peer))?;
    probe.connect(peer)?;
    Ok(probe.local_addr()?.ip())
}

/// One binding test. `Ok(None)` means no answer arrived.
fn binding(
    socket: &UdpSocket,
    dest: SocketAddr,
    change: u32,
) -> Result<Option<BindingResponse>, ClientError> {
    let (transaction_id, request) = build_binding_request(change);
    let mut buf = [0u8; 1024];
    for _ in 0..SENDS_PER_TEST {
        socket.send_to(&request, dest)?;
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, _from)) => match parse_binding_response(&buf[..len], &transaction_id) {
                    Ok(response) => return Ok(Some(response)),
                    // stale answer to an earlier test
                    Err(err) => debug!("ignoring stun packet: {}", err),
                },
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(None)
}

fn build_binding_request(change: u32) -> ([u8; 12], Vec<u8>) {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);

    let attr_len: u16 = if change != 0 { 8 } else { 0 };
    let mut buf = Vec::with_capacity(20 + attr_len as usize);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&attr_len.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(&transaction_id);
    if change != 0 {
        buf.extend_from_slice(&ATTR_CHANGE_REQUEST.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&change.to_be_bytes());
    }
    (transaction_id, buf)
}

fn parse_binding_response(
    buf: &[u8],
    transaction_id: &[u8; 12],
) -> Result<BindingResponse, ClientError> {
    if buf.len() < 20 {
        return Err(ClientError::Stun("response too short".into()));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(ClientError::Stun(format!(
            "unexpected response type {msg_type:04x}"
        )));
    }
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < 20 + msg_len {
        return Err(ClientError::Stun("response length mismatch".into()));
    }
    if buf[8..20] != transaction_id[..] {
        return Err(ClientError::Stun("transaction id mismatch".into()));
    }

    let mut xor_mapped = None;
    let mut mapped = None;
    let mut alternate = None;
    let mut offset = 20;
    let end = 20 + msg_len;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > end {
            break;
        }
        let attr = &buf[offset..offset + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = parse_xor_mapped(attr, transaction_id),
            ATTR_MAPPED_ADDRESS => mapped = parse_mapped(attr),
            ATTR_OTHER_ADDRESS | ATTR_CHANGED_ADDRESS => {
                alternate = alternate.or_else(|| parse_mapped(attr))
            }
            _ => {}
        }
        offset += (attr_len + 3) & !3;
    }

    let mapped = xor_mapped
        .or(mapped)
        .ok_or_else(|| ClientError::Stun("response missing mapped address".into()))?;
    Ok(BindingResponse { mapped, alternate })
}

fn parse_mapped(attr: &[u8]) -> Option<SocketAddr> {
    if attr.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([attr[2], attr[3]]);
    match attr[1] {
        0x01 if attr.len() >= 8 => {
            let addr = Ipv4Addr::new(attr[4], attr[5], attr[6], attr[7]);
            Some(SocketAddr::new(IpAddr::V4(addr), port))
        }
        0x02 if attr.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&attr[4..20]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn parse_xor_mapped(attr: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if attr.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([attr[2], attr[3]]) ^ ((MAGIC_COOKIE >> 16) as u16);
    match attr[1] {
        0x01 if attr.len() >= 8 => {
            let xaddr = u32::from_be_bytes([attr[4], attr[5], attr[6], attr[7]]) ^ MAGIC_COOKIE;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(xaddr)), port))
        }
        0x02 if attr.len() >= 20 => {
            let mut xor = [0u8; 16];
            xor[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor[4..16].copy_from_slice(transaction_id);
            let mut addr = [0u8; 16];
            for (i, byte) in addr.iter_mut().enumerate() {
                *byte = attr[4 + i] ^ xor[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), port))
        }
        _ => None,
    }
}
