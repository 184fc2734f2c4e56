use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::{task, time};
use tracing::{debug, info, warn};

use super::addresses::local_addresses_via;
use super::{PortMapping, Protocol};
use crate::error::{AddMappingFailure, AttemptFailure, DiscoveryError, MappingError};
use crate::events::{Event, EventSender, Level, Remediation};

/// Remote host value for gateways that reject the empty wildcard
pub const REMOTE_HOST_SENTINEL: &str = "0";
/// Description used by the last fallback attempt
pub const MINIMAL_DESCRIPTION: &str = "UPnP";
/// Guard against gateways that never report the end of the mapping table
pub const MAX_LISTED_MAPPINGS: u32 = 1024;
/// Bound on the control calls made once a gateway has answered the search
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

/// One AddPortMapping call as sent to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRequest {
    pub external_port: u16,
    pub internal: SocketAddrV4,
    pub protocol: Protocol,
    pub description: String,
    /// Empty means any remote host
    pub remote_host: String,
    /// Seconds, zero for a permanent mapping
    pub lease_duration: u32,
}

impl MappingRequest {
    pub fn new(external_port: u16, internal: SocketAddrV4, protocol: Protocol, description: impl Into<String>) -> Self {
        Self {
            external_port,
            internal,
            protocol,
            description: description.into(),
            remote_host: String::new(),
            lease_duration: 0,
        }
    }
}

/// The remote procedures a gateway control endpoint offers.
///
/// Calls block; the session runs them on the blocking thread pool.
pub trait ControlPoint: Send + Sync {
    fn external_ip(&self) -> Result<IpAddr, MappingError>;

    fn add_port_mapping(&self, request: &MappingRequest) -> Result<(), MappingError>;

    fn delete_port_mapping(&self, external_port: u16, protocol: Protocol) -> Result<(), MappingError>;

    /// Entry at `index` of the gateway's mapping table, `None` past the last one
    fn port_mapping_entry(&self, index: u32) -> Result<Option<PortMapping>, MappingError>;
}

/// Result of a device search: the selected gateway and how many answered
pub struct FoundGateway {
    pub control: Arc<dyn ControlPoint>,
    /// LAN-side address of the gateway's control endpoint
    pub control_addr: SocketAddr,
    pub device_count: usize,
}

/// Broadcast search for Internet Gateway Devices
pub trait GatewayFinder: Send + Sync {
    /// Blocks for at most `timeout`
    fn find(&self, timeout: Duration) -> Result<FoundGateway, DiscoveryError>;
}

/// The gateway currently in use. Replaced as a whole, never mutated.
pub struct GatewayHandle {
    control: Arc<dyn ControlPoint>,
    /// LAN-side control endpoint of the gateway
    pub gateway_addr: SocketAddr,
    /// This host's address on the gateway's LAN
    pub local_addr: Ipv4Addr,
    /// WAN-side address reported by the gateway
    pub external_ip: IpAddr,
    pub device_count: usize,
}

impl fmt::Debug for GatewayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayHandle")
            .field("control", &"<ControlPoint>")
            .field("gateway_addr", &self.gateway_addr)
            .field("local_addr", &self.local_addr)
            .field("external_ip", &self.external_ip)
            .field("device_count", &self.device_count)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Connected,
    DiscoveryFailed,
}

/// One formulation of the AddPortMapping call, tried in [`FALLBACK_CHAIN`] order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptStrategy {
    /// Caller's description, wildcard remote host
    Standard,
    /// Explicit remote host for gateways that reject an empty one
    RemoteHostSentinel,
    /// Short alphanumeric description
    ShortDescription,
    /// Requested external port plus one
    AlternatePort,
    /// Fixed minimal description
    MinimalDescription,
}

pub const FALLBACK_CHAIN: [AttemptStrategy; 5] = [
    AttemptStrategy::Standard,
    AttemptStrategy::RemoteHostSentinel,
    AttemptStrategy::ShortDescription,
    AttemptStrategy::AlternatePort,
    AttemptStrategy::MinimalDescription,
];

impl AttemptStrategy {
    /// Derive this attempt's request from the caller's. `None` when it cannot apply.
    pub fn apply(&self, base: &MappingRequest) -> Option<MappingRequest> {
        let mut request = base.clone();
        match self {
            AttemptStrategy::Standard => {}
            AttemptStrategy::RemoteHostSentinel => {
                request.remote_host = REMOTE_HOST_SENTINEL.to_string();
            }
            AttemptStrategy::ShortDescription => {
                request.description = format!("Port{}", base.external_port);
            }
            AttemptStrategy::AlternatePort => {
                request.external_port = base.external_port.checked_add(1)?;
            }
            AttemptStrategy::MinimalDescription => {
                request.description = MINIMAL_DESCRIPTION.to_string();
            }
        }
        Some(request)
    }
}

impl fmt::Display for AttemptStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptStrategy::Standard => "standard parameters",
            AttemptStrategy::RemoteHostSentinel => "explicit remote host",
            AttemptStrategy::ShortDescription => "short description",
            AttemptStrategy::AlternatePort => "alternate external port",
            AttemptStrategy::MinimalDescription => "minimal parameters",
        };
        f.write_str(name)
    }
}

/// What a successful fallback chain ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingOutcome {
    pub strategy: AttemptStrategy,
    /// Port actually mapped; differs from the request after [`AttemptStrategy::AlternatePort`]
    pub external_port: u16,
    pub failures: Vec<AttemptFailure>,
}

impl MappingOutcome {
    /// Reason the first attempt failed, if it did
    pub fn primary_failure(&self) -> Option<&MappingError> {
        self.failures.first().map(|f| &f.error)
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    handle: Option<Arc<GatewayHandle>>,
}

/// Owns the active gateway and every operation against it
pub struct GatewaySession {
    finder: Arc<dyn GatewayFinder>,
    control_timeout: Duration,
    inner: RwLock<SessionInner>,
    events: EventSender,
}

impl fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySession")
            .field("finder", &"<GatewayFinder>")
            .field("control_timeout", &self.control_timeout)
            .field("inner", &self.inner)
            .finish()
    }
}

impl GatewaySession {
    pub fn new(finder: Arc<dyn GatewayFinder>, events: EventSender) -> Self {
        Self {
            finder,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            inner: RwLock::new(SessionInner {
                state: SessionState::Idle,
                handle: None,
            }),
            events,
        }
    }

    /// Bound the calls made to a gateway after it answered the search
    pub fn with_control_timeout(mut self, control_timeout: Duration) -> Self {
        self.control_timeout = control_timeout;
        self
    }

    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    /// The active gateway, if discovery succeeded
    pub async fn handle(&self) -> Option<Arc<GatewayHandle>> {
        self.inner.read().await.handle.clone()
    }

    /// Forget the active gateway
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = SessionState::Idle;
        inner.handle = None;
        info!("Gateway session reset");
    }

    /// Search for a gateway and make it the active one.
    ///
    /// The search is bounded by `timeout`; no answer in time is `NoDeviceFound`.
    /// Once a gateway answered, the follow-up queries get their own bound and a
    /// failure there is `SelectionFailed`.
    pub async fn discover(&self, timeout: Duration) -> Result<Arc<GatewayHandle>, DiscoveryError> {
        self.inner.write().await.state = SessionState::Discovering;
        self.events.post(Event::DiscoveryStarted);
        info!("Discovering UPnP devices (timeout {:?})", timeout);

        let finder = Arc::clone(&self.finder);
        let search = task::spawn_blocking(move || finder.find(timeout));

        let result = match time::timeout(timeout, search).await {
            Ok(Ok(Ok(found))) => self.select(found).await,
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(DiscoveryError::SelectionFailed(format!("Discovery task failed: {}", e))),
            Err(_) => Err(DiscoveryError::NoDeviceFound),
        };

        match result {
            Ok(handle) => {
                let handle = Arc::new(handle);
                self.probe_capabilities(&handle).await;

                {
                    let mut inner = self.inner.write().await;
                    inner.state = SessionState::Connected;
                    inner.handle = Some(Arc::clone(&handle));
                }

                info!(
                    "Connected to gateway {} (external IP {}, {} device(s))",
                    handle.gateway_addr, handle.external_ip, handle.device_count
                );
                self.events.post(Event::DiscoverySucceeded {
                    gateway: handle.gateway_addr,
                    external_ip: handle.external_ip,
                    device_count: handle.device_count,
                });
                Ok(handle)
            }
            Err(e) => {
                {
                    let mut inner = self.inner.write().await;
                    inner.state = SessionState::DiscoveryFailed;
                    inner.handle = None;
                }

                warn!("Gateway discovery failed: {}", e);
                self.events.post(Event::DiscoveryFailed { reason: e.to_string() });
                Err(e)
            }
        }
    }

    /// Query a gateway that answered the search and build its handle
    async fn select(&self, found: FoundGateway) -> Result<GatewayHandle, DiscoveryError> {
        let FoundGateway { control, control_addr, device_count } = found;
        debug!("Gateway {} answered, querying its external address", control_addr);

        let query_control = Arc::clone(&control);
        let query = task::spawn_blocking(move || -> Result<(IpAddr, Ipv4Addr), DiscoveryError> {
            let external_ip = query_control
                .external_ip()
                .map_err(|e| DiscoveryError::SelectionFailed(format!("GetExternalIPAddress failed: {}", e)))?;
            let local_addr = local_addresses_via(control_addr)
                .first()
                .copied()
                .unwrap_or(Ipv4Addr::LOCALHOST);
            Ok((external_ip, local_addr))
        });

        let (external_ip, local_addr) = match time::timeout(self.control_timeout, query).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(DiscoveryError::SelectionFailed(format!("Discovery task failed: {}", e))),
            Err(_) => {
                return Err(DiscoveryError::SelectionFailed(format!(
                    "Gateway {} did not answer within {:?}",
                    control_addr, self.control_timeout
                )))
            }
        };

        Ok(GatewayHandle {
            control,
            gateway_addr: control_addr,
            local_addr,
            external_ip,
            device_count,
        })
    }

    /// Reset, then discover again
    pub async fn refresh(&self, timeout: Duration) -> Result<Arc<GatewayHandle>, DiscoveryError> {
        self.reset().await;
        self.discover(timeout).await
    }

    // Diagnostics only, never fails discovery
    async fn probe_capabilities(&self, handle: &Arc<GatewayHandle>) {
        self.events.post(Event::notice(
            Level::Info,
            format!("Gateway control endpoint: {}", handle.gateway_addr),
        ));
        self.events.post(Event::notice(
            Level::Info,
            format!("Local address on gateway LAN: {}", handle.local_addr),
        ));

        match enumerate(handle).await {
            Ok(MappingTable { mappings, interrupted: Some(e) }) if mappings.is_empty() => {
                warn!("Gateway refused to list port mappings: {}", e);
                self.events.post(Event::notice(
                    Level::Warning,
                    format!("Could not read existing port mappings: {}", e),
                ));
            }
            Ok(table) => self.events.post(Event::notice(
                Level::Info,
                format!("Gateway currently has {} port mapping(s)", table.mappings.len()),
            )),
            Err(e) => {
                warn!("Capability check failed: {}", e);
                self.events.post(Event::notice(
                    Level::Warning,
                    "Could not read existing port mappings",
                ));
            }
        }
    }

    async fn require_handle(&self) -> Result<Arc<GatewayHandle>, MappingError> {
        self.handle().await.ok_or(MappingError::NoGateway)
    }

    /// Create a mapping, walking [`FALLBACK_CHAIN`] until one attempt succeeds.
    ///
    /// Every failed attempt is posted as a warning notice before the next one
    /// runs. On total failure the reported error is the first attempt's.
    pub async fn add_mapping(
        &self,
        external_port: u16,
        internal: SocketAddrV4,
        protocol: Protocol,
        description: &str,
    ) -> Result<MappingOutcome, AddMappingFailure> {
        let handle = self.require_handle().await.map_err(|error| AddMappingFailure {
            error,
            attempts: Vec::new(),
            remediation: None,
        })?;

        let base = MappingRequest::new(external_port, internal, protocol, description);
        let mut failures: Vec<AttemptFailure> = Vec::new();

        for strategy in FALLBACK_CHAIN {
            let Some(request) = strategy.apply(&base) else {
                debug!("Skipping {} for external port {}", strategy, external_port);
                continue;
            };

            debug!("Trying AddPortMapping with {}: {:?}", strategy, request);
            let mapped_port = request.external_port;
            match call(&handle, move |control| control.add_port_mapping(&request)).await {
                Ok(()) => {
                    info!(
                        "Mapped {} {} -> {} using {}",
                        protocol, mapped_port, internal, strategy
                    );
                    return Ok(MappingOutcome {
                        strategy,
                        external_port: mapped_port,
                        failures,
                    });
                }
                Err(error) => {
                    warn!("AddPortMapping with {} failed: {}", strategy, error);
                    self.events.post(Event::notice(
                        Level::Warning,
                        format!("Attempt with {} failed: {}", strategy, error),
                    ));
                    failures.push(AttemptFailure { strategy, error });
                }
            }
        }

        let error = failures
            .first()
            .map(|f| f.error.clone())
            .unwrap_or_else(|| MappingError::Unknown("no attempt could be made".to_string()));
        let remediation = remediation_for(&error, *internal.ip(), &host_addresses(&handle).await);

        Err(AddMappingFailure {
            error,
            attempts: failures,
            remediation,
        })
    }

    /// Send exactly one AddPortMapping, no fallbacks and no notices
    pub async fn add_mapping_once(&self, request: MappingRequest) -> Result<(), MappingError> {
        let handle = self.require_handle().await?;
        call(&handle, move |control| control.add_port_mapping(&request)).await
    }

    /// Delete the mapping keyed by `(external_port, protocol)`
    pub async fn remove_mapping(&self, external_port: u16, protocol: Protocol) -> Result<(), MappingError> {
        let handle = self.require_handle().await?;
        call(&handle, move |control| control.delete_port_mapping(external_port, protocol)).await?;
        info!("Removed {} mapping for external port {}", protocol, external_port);
        Ok(())
    }

    /// Read the gateway's mapping table from index 0.
    ///
    /// A failing entry ends the list; the entries read before it are returned.
    pub async fn list_mappings(&self) -> Result<Vec<PortMapping>, MappingError> {
        let handle = self.require_handle().await?;
        let table = enumerate(&handle).await?;
        if let Some(e) = &table.interrupted {
            warn!("Mapping table read stopped after {} entries: {}", table.mappings.len(), e);
        }
        Ok(table.mappings)
    }

    pub async fn find_mapping(&self, external_port: u16, protocol: Protocol) -> Result<Option<PortMapping>, MappingError> {
        let mappings = self.list_mappings().await?;
        Ok(mappings.into_iter().find(|m| m.matches(external_port, protocol)))
    }
}

/// Hint offered when a mapping could not be created.
///
/// `host_addrs` are this host's own addresses; a target outside them gets the
/// map-to-local hint on InvalidArgs.
fn remediation_for(error: &MappingError, target: Ipv4Addr, host_addrs: &[Ipv4Addr]) -> Option<Remediation> {
    let is_local = target.is_loopback() || host_addrs.contains(&target);
    match error {
        MappingError::InvalidArgs(_) if !is_local => Some(Remediation::MapToLocalHost),
        MappingError::Conflict(_) => Some(Remediation::ChooseDifferentPort),
        _ => None,
    }
}

/// Every IPv4 address of this host, the gateway-facing one included
async fn host_addresses(handle: &GatewayHandle) -> Vec<Ipv4Addr> {
    let gateway = handle.gateway_addr;
    let mut addrs = task::spawn_blocking(move || local_addresses_via(gateway))
        .await
        .unwrap_or_default();
    if !addrs.contains(&handle.local_addr) {
        addrs.push(handle.local_addr);
    }
    addrs
}

/// Run one blocking control call against `handle`
async fn call<T, F>(handle: &GatewayHandle, f: F) -> Result<T, MappingError>
where
    F: FnOnce(&dyn ControlPoint) -> Result<T, MappingError> + Send + 'static,
    T: Send + 'static,
{
    let control = Arc::clone(&handle.control);
    task::spawn_blocking(move || f(control.as_ref()))
        .await
        .map_err(|e| MappingError::Unknown(format!("Gateway task failed: {}", e)))?
}

/// Entries read from the gateway's mapping table
#[derive(Debug, Default)]
struct MappingTable {
    mappings: Vec<PortMapping>,
    /// Error that ended the read before the gateway reported the end
    interrupted: Option<MappingError>,
}

async fn enumerate(handle: &GatewayHandle) -> Result<MappingTable, MappingError> {
    call(handle, |control| {
        let mut table = MappingTable::default();
        for index in 0..MAX_LISTED_MAPPINGS {
            match control.port_mapping_entry(index) {
                Ok(Some(mapping)) => table.mappings.push(mapping),
                Ok(None) => {
                    debug!("Mapping table ends at index {}", index);
                    break;
                }
                Err(e) => {
                    debug!("Reading mapping {} failed: {}", index, e);
                    table.interrupted = Some(e);
                    break;
                }
            }
        }
        Ok(table)
    })
    .await
}
