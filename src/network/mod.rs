mod addresses;
mod gateway;
mod igd;
mod relay;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ArgumentError;

pub use addresses::{
    local_addresses, local_addresses_via, scan_reachable, subnet_candidates, tcp_connect,
    PingProber, Prober, SubnetCandidates, TcpProber,
};
pub use gateway::{
    AttemptStrategy, ControlPoint, FoundGateway, GatewayFinder, GatewayHandle, GatewaySession,
    MappingOutcome, MappingRequest, SessionState, FALLBACK_CHAIN, MAX_LISTED_MAPPINGS,
};
pub use igd::{IgdControlPoint, IgdFinder};
pub use relay::{RelayHandle, RelayServer};

/// Configuration for the network module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// How long to wait for gateways to answer the discovery broadcast
    pub discovery_timeout: Duration,
    /// Upper bound for a single reachability probe
    pub probe_timeout: Duration,
    /// Upper bound for establishing a TCP connection
    pub connect_timeout: Duration,
    /// Number of subnet candidates probed by a scan
    pub scan_limit: usize,
    /// Maximum number of probes in flight during a scan
    pub scan_concurrency: usize,
    /// Size of each relay pump buffer
    pub relay_buffer_size: usize,
    /// External port used for the temporary mapping of a connection test
    pub test_mapping_port: u16,
    /// Well-known external address used to let the OS pick the outbound interface
    pub probe_address: SocketAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_millis(2000),
            probe_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(3),
            scan_limit: 20,
            scan_concurrency: 16,
            relay_buffer_size: 4096,
            test_mapping_port: 9999,
            probe_address: SocketAddr::from(([8, 8, 8, 8], 80)),
        }
    }
}

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ArgumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            _ => Err(ArgumentError::InvalidProtocol(s.to_string())),
        }
    }
}

/// A forwarding rule as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_port: u16,
    pub internal_address: Ipv4Addr,
    pub protocol: Protocol,
    pub description: String,
    pub enabled: bool,
}

impl PortMapping {
    /// Whether this entry occupies the `(external_port, protocol)` key
    pub fn matches(&self, external_port: u16, protocol: Protocol) -> bool {
        self.external_port == external_port && self.protocol == protocol
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}:{} ({}, {})",
            self.protocol,
            self.external_port,
            self.internal_address,
            self.internal_port,
            self.description,
            if self.enabled { "enabled" } else { "disabled" }
        )
    }
}

/// Dotted-quad check: exactly four components, each 1-3 digits in 0..=255
pub fn validate_ipv4(ip: &str) -> bool {
    parse_ipv4(ip).is_ok()
}

/// Parse a dotted-quad IPv4 address. Leading zeros are accepted.
pub fn parse_ipv4(ip: &str) -> Result<Ipv4Addr, ArgumentError> {
    let invalid = || ArgumentError::InvalidAddress(ip.to_string());

    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in ip.split('.') {
        if count == 4 || part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: u16 = part.parse().map_err(|_| invalid())?;
        octets[count] = u8::try_from(value).map_err(|_| invalid())?;
        count += 1;
    }

    if count != 4 {
        return Err(invalid());
    }
    Ok(Ipv4Addr::from(octets))
}

/// Parse a non-zero port number
pub fn parse_port(port: &str) -> Result<u16, ArgumentError> {
    let value: u16 = port
        .trim()
        .parse()
        .map_err(|_| ArgumentError::InvalidPort(port.to_string()))?;
    if value == 0 {
        return Err(ArgumentError::ZeroPort);
    }
    Ok(value)
}
