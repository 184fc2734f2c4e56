use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::process::Stdio;
use std::time::Duration;
use futures::future::{self, BoxFuture};
use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, trace};

use crate::error::ProbeError;

/// Well-known external address used to let the routing table pick an interface
const DEFAULT_ROUTE_PROBE: ([u8; 4], u16) = ([8, 8, 8, 8], 80);

/// Local IPv4 addresses, preferred (outbound) address first.
///
/// Never fails: when nothing can be determined the result is `[127.0.0.1]`.
pub fn local_addresses() -> Vec<Ipv4Addr> {
    local_addresses_via(SocketAddr::from(DEFAULT_ROUTE_PROBE))
}

/// Same as [`local_addresses`] but selects the outbound interface by routing toward `probe`
pub fn local_addresses_via(probe: SocketAddr) -> Vec<Ipv4Addr> {
    let mut addrs = Vec::new();

    match outbound_address(probe) {
        Ok(ip) => addrs.push(ip),
        Err(e) => debug!("Could not determine outbound address via {}: {}", probe, e),
    }

    match host_addresses() {
        Ok(host_addrs) => {
            for ip in host_addrs {
                if !ip.is_loopback() && !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
        }
        Err(e) => debug!("Could not list network interfaces: {}", e),
    }

    if addrs.is_empty() {
        addrs.push(Ipv4Addr::LOCALHOST);
    }
    addrs
}

fn outbound_address(probe: SocketAddr) -> io::Result<Ipv4Addr> {
    // Connecting a datagram socket sends nothing, it only binds a route
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(probe)?;

    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => Ok(ip),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable outbound IPv4 address ({})", other),
        )),
    }
}

fn host_addresses() -> io::Result<Vec<Ipv4Addr>> {
    let addrs = if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|interface| !interface.is_loopback())
        .filter_map(|interface| match interface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();
    Ok(addrs)
}

/// Lazy walk over `a.b.c.1 ..= a.b.c.254`, skipping the base address
#[derive(Debug, Clone)]
pub struct SubnetCandidates {
    prefix: [u8; 3],
    skip: u8,
    next: u16,
}

impl Iterator for SubnetCandidates {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        while self.next <= 254 {
            let host = self.next as u8;
            self.next += 1;
            if host != self.skip {
                let [a, b, c] = self.prefix;
                return Some(Ipv4Addr::new(a, b, c, host));
            }
        }
        None
    }
}

/// Every host address sharing the first three octets of `base`, ascending
pub fn subnet_candidates(base: Ipv4Addr) -> SubnetCandidates {
    let [a, b, c, d] = base.octets();
    SubnetCandidates {
        prefix: [a, b, c],
        skip: d,
        next: 1,
    }
}

/// A bounded-time liveness check for one address
pub trait Prober: Send + Sync {
    /// `Ok(true)` when the host answered within `timeout`
    fn probe(&self, addr: Ipv4Addr, timeout: Duration) -> BoxFuture<'_, Result<bool, ProbeError>>;
}

/// ICMP echo through the system `ping` utility
#[derive(Debug, Clone, Default)]
pub struct PingProber;

impl PingProber {
    fn command(addr: Ipv4Addr, timeout: Duration) -> Command {
        let mut cmd = Command::new("ping");

        #[cfg(windows)]
        cmd.args(["-n", "1", "-w", &timeout.as_millis().max(1).to_string()]);

        #[cfg(target_os = "macos")]
        cmd.args(["-c", "1", "-t", &timeout.as_secs().max(1).to_string()]);

        #[cfg(all(unix, not(target_os = "macos")))]
        cmd.args(["-c", "1", "-W", &timeout.as_secs().max(1).to_string()]);

        cmd.arg(addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl Prober for PingProber {
    fn probe(&self, addr: Ipv4Addr, timeout: Duration) -> BoxFuture<'_, Result<bool, ProbeError>> {
        Box::pin(async move {
            let mut cmd = Self::command(addr, timeout);
            let status = time::timeout(timeout, cmd.status())
                .await
                .map_err(|_| ProbeError::Timeout(timeout))??;
            ping_outcome(addr, status.code())
        })
    }
}

/// Read a `ping` exit code: 0 answered, 1 no reply, 2 the echo could not be sent
fn ping_outcome(addr: Ipv4Addr, code: Option<i32>) -> Result<bool, ProbeError> {
    match code {
        Some(0) => Ok(true),
        Some(2) => Err(ProbeError::Unresolvable(addr)),
        _ => Ok(false),
    }
}

/// Liveness through a TCP handshake on a fixed port.
///
/// A refused connection still proves the host is up.
#[derive(Debug, Clone)]
pub struct TcpProber {
    pub port: u16,
}

impl Prober for TcpProber {
    fn probe(&self, addr: Ipv4Addr, timeout: Duration) -> BoxFuture<'_, Result<bool, ProbeError>> {
        let target = SocketAddr::from((addr, self.port));
        Box::pin(async move {
            match tcp_connect(target, timeout).await {
                Ok(_) => Ok(true),
                Err(ProbeError::IoError(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(true),
                Err(e) => Err(e),
            }
        })
    }
}

/// TCP connect that gives up after `timeout`
pub async fn tcp_connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ProbeError> {
    let stream = time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;
    Ok(stream)
}

/// Probe at most `limit` candidates with at most `concurrency` probes in flight.
///
/// Every probe is cut off after `per_probe_timeout`; timeouts and probe errors
/// count as unreachable. An empty result is a normal outcome.
pub async fn scan_reachable<P, I>(
    candidates: I,
    limit: usize,
    concurrency: usize,
    per_probe_timeout: Duration,
    prober: &P,
) -> HashSet<Ipv4Addr>
where
    P: Prober + ?Sized,
    I: IntoIterator<Item = Ipv4Addr>,
{
    stream::iter(candidates.into_iter().take(limit))
        .map(|ip| async move {
            match time::timeout(per_probe_timeout, prober.probe(ip, per_probe_timeout)).await {
                Ok(Ok(true)) => {
                    debug!("Host {} is reachable", ip);
                    Some(ip)
                }
                Ok(Ok(false)) => None,
                Ok(Err(e)) => {
                    trace!("Probe of {} failed: {}", ip, e);
                    None
                }
                Err(_) => {
                    trace!("Probe of {} timed out", ip);
                    None
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(future::ready)
        .collect()
        .await
}
