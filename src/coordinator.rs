use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{self, JoinHandle};
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::{ArgumentError, MappingError, RelayError};
use crate::events::{event_bus, Event, EventReceiver, EventSender, Level, Remediation};
use crate::network::{
    local_addresses_via, parse_ipv4, scan_reachable, subnet_candidates, tcp_connect, AttemptStrategy,
    GatewayFinder, GatewaySession, IgdFinder, MappingRequest, NetworkConfig, PingProber, Prober,
    Protocol, RelayHandle, RelayServer,
};

struct Shared {
    config: NetworkConfig,
    session: GatewaySession,
    relay: RelayServer,
    prober: Arc<dyn Prober>,
    relays: Mutex<HashMap<SocketAddr, RelayHandle>>,
    last_scan: RwLock<Vec<Ipv4Addr>>,
    events: EventSender,
}

/// Command surface for a presentation layer.
///
/// Every command validates its arguments synchronously, then runs as its own
/// tokio task and reports only through the event mailbox. The returned
/// `JoinHandle` may be awaited or ignored.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Coordinator talking to real gateways through UPnP and probing with `ping`
    pub fn with_defaults(config: NetworkConfig) -> (Self, EventReceiver) {
        Self::new(config, Arc::new(IgdFinder::default()), Arc::new(PingProber))
    }

    pub fn new(
        config: NetworkConfig,
        finder: Arc<dyn GatewayFinder>,
        prober: Arc<dyn Prober>,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = event_bus();
        let shared = Shared {
            session: GatewaySession::new(finder, events.clone()).with_control_timeout(config.connect_timeout),
            relay: RelayServer::new(&config, events.clone()),
            config,
            prober,
            relays: Mutex::new(HashMap::new()),
            last_scan: RwLock::new(Vec::new()),
            events,
        };
        (Self { shared: Arc::new(shared) }, receiver)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    pub fn session(&self) -> &GatewaySession {
        &self.shared.session
    }

    pub fn relay_server(&self) -> &RelayServer {
        &self.shared.relay
    }

    fn spawn<F, Fut>(&self, work: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<Shared>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(work(Arc::clone(&self.shared)))
    }

    pub fn discover(&self) -> JoinHandle<()> {
        self.spawn(|shared| async move {
            // Outcome is reported by the session itself
            let _ = shared.session.discover(shared.config.discovery_timeout).await;
        })
    }

    /// Drop the active gateway and search again
    pub fn refresh(&self) -> JoinHandle<()> {
        self.spawn(|shared| async move {
            shared.events.post(Event::notice(Level::Info, "Refreshing devices..."));
            let _ = shared.session.refresh(shared.config.discovery_timeout).await;
        })
    }

    pub fn add_mapping(
        &self,
        external_port: u16,
        internal_ip: &str,
        internal_port: u16,
        protocol: Protocol,
        description: &str,
    ) -> Result<JoinHandle<()>, ArgumentError> {
        let internal = SocketAddrV4::new(parse_ipv4(internal_ip)?, nonzero(internal_port)?);
        let external_port = nonzero(external_port)?;
        let description = description.to_string();

        Ok(self.spawn(move |shared| async move {
            info!("Adding port mapping: {} {} -> {}", protocol, external_port, internal);
            match shared.session.add_mapping(external_port, internal, protocol, &description).await {
                Ok(outcome) => {
                    let mut message = format!(
                        "Port mapping added: {} {} -> {}",
                        protocol, outcome.external_port, internal
                    );
                    if outcome.strategy != AttemptStrategy::Standard {
                        message.push_str(&format!(" (using {})", outcome.strategy));
                    }
                    shared.events.post(Event::succeeded(message));
                }
                Err(failure) => {
                    shared.events.post(Event::failed(
                        format!("Failed to add port mapping: {}", failure.error),
                        failure.remediation,
                    ));
                }
            }
        }))
    }

    pub fn remove_mapping(&self, external_port: u16, protocol: Protocol) -> Result<JoinHandle<()>, ArgumentError> {
        let external_port = nonzero(external_port)?;

        Ok(self.spawn(move |shared| async move {
            info!("Removing port mapping: {} {}", protocol, external_port);
            match shared.session.remove_mapping(external_port, protocol).await {
                Ok(()) => shared.events.post(Event::succeeded(format!(
                    "Port mapping removed: {} {}",
                    protocol, external_port
                ))),
                Err(e) => shared.events.post(Event::failed(
                    format!("Failed to remove port mapping: {}", e),
                    None,
                )),
            }
        }))
    }

    pub fn list_mappings(&self) -> JoinHandle<()> {
        self.spawn(|shared| async move {
            match shared.session.list_mappings().await {
                Ok(mappings) => {
                    if mappings.is_empty() {
                        shared.events.post(Event::notice(
                            Level::Info,
                            "No port mappings found, or the gateway does not support listing them",
                        ));
                    }
                    shared.events.post(Event::MappingsListed { mappings });
                }
                Err(e) => shared.events.post(Event::failed(
                    format!("Failed to read port mappings: {}", e),
                    None,
                )),
            }
        })
    }

    /// Report whether `(external_port, protocol)` is free on the gateway.
    ///
    /// A free port is confirmed with a temporary loopback mapping that is
    /// removed straight away.
    pub fn check_port(&self, external_port: u16, protocol: Protocol) -> Result<JoinHandle<()>, ArgumentError> {
        let external_port = nonzero(external_port)?;

        Ok(self.spawn(move |shared| async move {
            let session = &shared.session;
            match session.find_mapping(external_port, protocol).await {
                Err(e) => shared.events.post(Event::failed(format!("Port check failed: {}", e), None)),
                Ok(Some(existing)) => shared.events.post(Event::failed(
                    format!(
                        "Port {} ({}) is already mapped to {}:{}",
                        external_port, protocol, existing.internal_address, existing.internal_port
                    ),
                    Some(Remediation::ChooseDifferentPort),
                )),
                Ok(None) => {
                    shared.events.post(Event::notice(
                        Level::Info,
                        format!("Port {} ({}) has no existing mapping", external_port, protocol),
                    ));

                    let temporary = MappingRequest::new(
                        external_port,
                        SocketAddrV4::new(Ipv4Addr::LOCALHOST, external_port),
                        protocol,
                        "PortCheck",
                    );
                    match session.add_mapping_once(temporary).await {
                        Ok(()) => {
                            cleanup_temporary_mapping(&shared, external_port, protocol).await;
                            shared.events.post(Event::succeeded(format!(
                                "Port {} ({}) is available",
                                external_port, protocol
                            )));
                        }
                        Err(e) => shared.events.post(Event::failed(
                            format!("Port {} ({}) test mapping failed: {}", external_port, protocol, e),
                            match e {
                                MappingError::InvalidArgs(_) | MappingError::Conflict(_) => {
                                    Some(Remediation::ChooseDifferentPort)
                                }
                                _ => None,
                            },
                        )),
                    }
                }
            }
        }))
    }

    /// Reachability, TCP connect and (with an active gateway) a temporary mapping to `ip:port`
    pub fn test_connection(&self, ip: &str, port: u16) -> Result<JoinHandle<()>, ArgumentError> {
        let ip = parse_ipv4(ip)?;
        let port = nonzero(port)?;

        Ok(self.spawn(move |shared| async move {
            let config = &shared.config;
            let target = SocketAddr::from((ip, port));
            shared.events.post(Event::notice(Level::Info, format!("Testing connection to {}...", ip)));

            let ping = time::timeout(config.probe_timeout, shared.prober.probe(ip, config.probe_timeout)).await;
            match ping {
                Ok(Ok(true)) => shared.events.post(Event::notice(Level::Success, format!("Ping {} succeeded", ip))),
                Ok(Ok(false)) => shared.events.post(Event::notice(Level::Error, format!("Ping {} failed", ip))),
                Ok(Err(e)) => shared.events.post(Event::notice(Level::Error, format!("Ping test failed: {}", e))),
                Err(_) => shared.events.post(Event::notice(Level::Error, format!("Ping {} timed out", ip))),
            }

            let connected = match tcp_connect(target, config.connect_timeout).await {
                Ok(_) => {
                    shared.events.post(Event::notice(Level::Success, format!("Port {} accepted a connection", port)));
                    true
                }
                Err(e) => {
                    shared.events.post(Event::notice(
                        Level::Warning,
                        format!("Port {} did not accept a connection: {}", port, e),
                    ));
                    false
                }
            };

            let mut mapping_rejected = false;
            if shared.session.handle().await.is_some() {
                let test_port = config.test_mapping_port;
                let temporary = MappingRequest::new(test_port, SocketAddrV4::new(ip, port), Protocol::Tcp, "TestConnection");
                match shared.session.add_mapping_once(temporary).await {
                    Ok(()) => {
                        shared.events.post(Event::notice(Level::Success, "UPnP port mapping works for this target"));
                        cleanup_temporary_mapping(&shared, test_port, Protocol::Tcp).await;
                    }
                    Err(e) => {
                        mapping_rejected = e.is_invalid_args() && !ip.is_loopback();
                        shared.events.post(Event::notice(Level::Error, format!("UPnP test mapping failed: {}", e)));
                    }
                }
            } else {
                debug!("No active gateway, skipping mapping test");
            }

            if !connected {
                shared.events.post(Event::failed(
                    format!("Connection test to {} failed", target),
                    Some(Remediation::CheckTargetReachable),
                ));
            } else if mapping_rejected {
                shared.events.post(Event::failed(
                    format!("Gateway refused to map to {}", target),
                    Some(Remediation::MapToLocalHost),
                ));
            } else {
                shared.events.post(Event::succeeded(format!("Connection test to {} passed", target)));
            }
        }))
    }

    /// Probe the first `scan_limit` hosts of the local /24
    pub fn scan_subnet(&self) -> JoinHandle<()> {
        self.spawn(|shared| async move {
            let config = &shared.config;
            let base = lookup_local_addresses(config.probe_address)
                .await
                .first()
                .copied()
                .unwrap_or(Ipv4Addr::LOCALHOST);

            if base.is_loopback() {
                shared.events.post(Event::failed("Could not determine the local network, scan aborted", None));
                return;
            }

            let [a, b, c, _] = base.octets();
            shared.events.post(Event::notice(
                Level::Info,
                format!("Scanning {}.{}.{}.x (first {} addresses)", a, b, c, config.scan_limit),
            ));

            let found = scan_reachable(
                subnet_candidates(base),
                config.scan_limit,
                config.scan_concurrency,
                config.probe_timeout,
                shared.prober.as_ref(),
            )
            .await;

            let mut reachable: Vec<Ipv4Addr> = found.into_iter().collect();
            reachable.sort();
            for ip in &reachable {
                shared.events.post(Event::notice(Level::Success, format!("Found active device: {}", ip)));
            }
            if reachable.is_empty() {
                shared.events.post(Event::notice(Level::Warning, "No other active devices found"));
            }

            *shared.last_scan.write().await = reachable.clone();
            shared.events.post(Event::ScanCompleted { reachable });
        })
    }

    /// Relay `0.0.0.0:listen_port` to `target_ip:target_port`
    pub fn start_relay(&self, listen_port: u16, target_ip: &str, target_port: u16) -> Result<JoinHandle<()>, ArgumentError> {
        let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, nonzero(listen_port)?));
        let target = SocketAddr::from((parse_ipv4(target_ip)?, nonzero(target_port)?));
        Ok(self.start_relay_at(listen, target))
    }

    /// Relay an explicit listen address to `target`
    pub fn start_relay_at(&self, listen: SocketAddr, target: SocketAddr) -> JoinHandle<()> {
        self.spawn(move |shared| async move {
            match register_relay(&shared, listen, target).await {
                Ok(bound) => shared.events.post(Event::succeeded(format!("Relay started: {} -> {}", bound, target))),
                Err(e) => shared.events.post(Event::failed(format!("Failed to start relay: {}", e), None)),
            }
        })
    }

    /// Stop the relay registered under `listen`; false if there is none
    pub async fn stop_relay(&self, listen: SocketAddr) -> bool {
        let handle = self.shared.relays.lock().await.remove(&listen);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all_relays(&self) {
        let handles: Vec<RelayHandle> = self.shared.relays.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    /// Running relays as `(listen, target)` pairs
    pub async fn relays(&self) -> Vec<(SocketAddr, SocketAddr)> {
        let relays = self.shared.relays.lock().await;
        let mut list: Vec<_> = relays.iter().map(|(listen, h)| (*listen, h.target())).collect();
        list.sort();
        list
    }

    /// Map `external_port` to this host, then relay it on to `target_ip:target_port`.
    ///
    /// Works around gateways that refuse to map to another LAN host.
    pub fn forward(
        &self,
        external_port: u16,
        target_ip: &str,
        target_port: u16,
        protocol: Protocol,
    ) -> Result<JoinHandle<()>, ArgumentError> {
        if protocol != Protocol::Tcp {
            return Err(ArgumentError::UnsupportedRelayProtocol(protocol.to_string()));
        }
        let external_port = nonzero(external_port)?;
        let target = SocketAddr::from((parse_ipv4(target_ip)?, nonzero(target_port)?));

        Ok(self.spawn(move |shared| async move {
            let Some(handle) = shared.session.handle().await else {
                shared.events.post(Event::failed(
                    format!("Failed to start forwarding: {}", MappingError::NoGateway),
                    None,
                ));
                return;
            };

            let local = SocketAddrV4::new(handle.local_addr, external_port);
            shared.events.post(Event::notice(
                Level::Info,
                format!("Mapping to this host ({}), then relaying to {}", local, target),
            ));

            let description = format!("Forward to {}", target);
            let outcome = match shared.session.add_mapping(external_port, local, protocol, &description).await {
                Ok(outcome) => outcome,
                Err(failure) => {
                    shared.events.post(Event::failed(
                        format!("Failed to map port to this host: {}", failure.error),
                        failure.remediation,
                    ));
                    return;
                }
            };
            shared.events.post(Event::notice(Level::Success, format!("Port mapped to this host: {}", local)));

            match register_relay(&shared, SocketAddr::V4(local), target).await {
                Ok(bound) => shared.events.post(Event::succeeded(format!(
                    "Forwarding {} -> {} -> {}",
                    SocketAddr::new(handle.external_ip, outcome.external_port),
                    bound,
                    target
                ))),
                Err(e) => {
                    warn!("Relay failed after mapping succeeded, removing mapping: {}", e);
                    if let Err(remove_err) = shared.session.remove_mapping(outcome.external_port, protocol).await {
                        shared.events.post(Event::notice(
                            Level::Warning,
                            format!("Mapping for port {} may not have been removed: {}", outcome.external_port, remove_err),
                        ));
                    }
                    shared.events.post(Event::failed(format!("Failed to start relay: {}", e), None));
                }
            }
        }))
    }

    /// This host's IPv4 addresses, preferred first
    pub async fn local_addresses(&self) -> Vec<Ipv4Addr> {
        lookup_local_addresses(self.shared.config.probe_address).await
    }

    /// Loopback, local addresses and the last scan's hosts, without duplicates
    pub async fn address_choices(&self) -> Vec<Ipv4Addr> {
        let mut choices = vec![Ipv4Addr::LOCALHOST];
        let scanned = self.shared.last_scan.read().await.clone();
        for ip in self.local_addresses().await.into_iter().chain(scanned) {
            if !choices.contains(&ip) {
                choices.push(ip);
            }
        }
        choices
    }

    /// External IP of the active gateway
    pub async fn external_ip(&self) -> Option<IpAddr> {
        self.shared.session.handle().await.map(|h| h.external_ip)
    }
}

fn nonzero(port: u16) -> Result<u16, ArgumentError> {
    if port == 0 {
        Err(ArgumentError::ZeroPort)
    } else {
        Ok(port)
    }
}

// Interface enumeration and routing lookups are blocking calls
async fn lookup_local_addresses(probe: SocketAddr) -> Vec<Ipv4Addr> {
    task::spawn_blocking(move || local_addresses_via(probe))
        .await
        .unwrap_or_else(|_| vec![Ipv4Addr::LOCALHOST])
}

async fn register_relay(shared: &Shared, listen: SocketAddr, target: SocketAddr) -> Result<SocketAddr, RelayError> {
    let mut relays = shared.relays.lock().await;
    if relays.contains_key(&listen) {
        return Err(RelayError::BindFailed {
            addr: listen,
            reason: "a relay is already running on this address".to_string(),
        });
    }

    let handle = shared.relay.start(listen, target).await?;
    let bound = handle.local_addr();
    let key = if listen.port() == 0 { bound } else { listen };
    relays.insert(key, handle);
    Ok(bound)
}

async fn cleanup_temporary_mapping(shared: &Shared, external_port: u16, protocol: Protocol) {
    match shared.session.remove_mapping(external_port, protocol).await {
        Ok(()) => shared.events.post(Event::notice(Level::Info, "Temporary test mapping removed")),
        Err(e) => shared.events.post(Event::notice(
            Level::Warning,
            format!("Temporary test mapping may not have been removed: {}", e),
        )),
    }
}
