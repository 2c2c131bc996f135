//! Bind-address resolution
//!
//! The `hostname` field of a producer config accepts a literal IP, a
//! resolvable host name, or a CIDR range. Resolution to a single bindable IP
//! happens once at channel initialization; the resolved address is exposed
//! read-only afterwards.
//!
//! CIDR specs are matched against the host's candidate addresses: the
//! primary outbound address (discovered with the connected-UDP-socket idiom,
//! which sends no packets) and loopback.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs, UdpSocket};

use crate::{ConfigError, Result};

/// Syntax-only validation of an address spec (no resolution)
pub(crate) fn validate_address_spec(spec: &str) -> Result<()> {
    if spec.contains('/') {
        parse_cidr(spec)?;
    }
    Ok(())
}

/// Resolve an address spec to a single bindable IP
pub fn resolve_bind_address(spec: &str) -> Result<IpAddr> {
    if spec.is_empty() || spec == "default" {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    // Literal IP
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(ip);
    }

    // CIDR range
    if spec.contains('/') {
        let (network, prefix) = parse_cidr(spec)?;
        for candidate in candidate_addresses() {
            if cidr_contains(network, prefix, candidate) {
                return Ok(candidate);
            }
        }
        return Err(ConfigError::address_resolution(
            spec,
            "no local address falls inside the range",
        ));
    }

    // Host name
    let mut addrs = (spec, 0u16)
        .to_socket_addrs()
        .map_err(|e| ConfigError::address_resolution(spec, e.to_string()))?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| ConfigError::address_resolution(spec, "name resolved to no addresses"))
}

/// Parse "a.b.c.d/len" or "v6addr/len"
fn parse_cidr(spec: &str) -> Result<(IpAddr, u8)> {
    let invalid = |message: &str| ConfigError::address_resolution(spec, message);

    let (addr, prefix) = spec
        .split_once('/')
        .ok_or_else(|| invalid("expected <address>/<prefix>"))?;
    let network: IpAddr = addr
        .parse()
        .map_err(|_| invalid("network part is not an IP address"))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| invalid("prefix is not a number"))?;
    let max = match network {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(invalid(&format!("prefix must be at most {max}")));
    }
    Ok((network, prefix))
}

/// Whether `addr` falls inside `network/prefix`
fn cidr_contains(network: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix as u32);
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix as u32);
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

/// Candidate local addresses for CIDR matching
fn candidate_addresses() -> Vec<IpAddr> {
    let mut candidates = Vec::new();
    if let Some(ip) = primary_outbound_address() {
        candidates.push(ip);
    }
    candidates.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    candidates.push(IpAddr::V6(Ipv6Addr::LOCALHOST));
    candidates
}

/// The address the host would use for outbound traffic
///
/// Connecting a UDP socket selects a route without sending anything.
fn primary_outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("198.51.100.1:53").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
