#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use portbridge::error::{DiscoveryError, MappingError, ProbeError};
use portbridge::events::{Event, EventReceiver};
use portbridge::network::{ControlPoint, FoundGateway, GatewayFinder, MappingRequest, Prober};
use portbridge::{Coordinator, NetworkConfig, PortMapping, Protocol};

pub const STUB_EXTERNAL_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

/// In-memory gateway. Add attempts consume scripted failures first, then
/// succeed against a mapping table keyed by `(external_port, protocol)`.
pub struct StubGateway {
    mappings: Mutex<Vec<PortMapping>>,
    add_script: Mutex<VecDeque<MappingError>>,
    requests: Mutex<Vec<MappingRequest>>,
    listing: bool,
    external_ip_delay: Duration,
}

impl StubGateway {
    pub fn new() -> Self {
        Self {
            mappings: Mutex::new(Vec::new()),
            add_script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            listing: true,
            external_ip_delay: Duration::ZERO,
        }
    }

    /// The next `errors.len()` AddPortMapping calls fail in order
    pub fn failing_adds(errors: Vec<MappingError>) -> Self {
        let stub = Self::new();
        *stub.add_script.lock().unwrap() = errors.into();
        stub
    }

    /// GetGenericPortMappingEntry always fails
    pub fn without_listing(mut self) -> Self {
        self.listing = false;
        self
    }

    /// GetExternalIPAddress blocks for `delay` before answering
    pub fn with_external_ip_delay(mut self, delay: Duration) -> Self {
        self.external_ip_delay = delay;
        self
    }

    pub fn with_mapping(self, mapping: PortMapping) -> Self {
        self.mappings.lock().unwrap().push(mapping);
        self
    }

    pub fn requests(&self) -> Vec<MappingRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn mappings(&self) -> Vec<PortMapping> {
        self.mappings.lock().unwrap().clone()
    }
}

impl ControlPoint for StubGateway {
    fn external_ip(&self) -> Result<IpAddr, MappingError> {
        std::thread::sleep(self.external_ip_delay);
        Ok(IpAddr::V4(STUB_EXTERNAL_IP))
    }

    fn add_port_mapping(&self, request: &MappingRequest) -> Result<(), MappingError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(error) = self.add_script.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut mappings = self.mappings.lock().unwrap();
        let entry = PortMapping {
            external_port: request.external_port,
            internal_port: request.internal.port(),
            internal_address: *request.internal.ip(),
            protocol: request.protocol,
            description: request.description.clone(),
            enabled: true,
        };
        match mappings.iter_mut().find(|m| m.matches(request.external_port, request.protocol)) {
            Some(existing) if existing.internal_address != entry.internal_address => {
                Err(MappingError::Conflict("718 ConflictInMappingEntry".to_string()))
            }
            Some(existing) => {
                *existing = entry;
                Ok(())
            }
            None => {
                mappings.push(entry);
                Ok(())
            }
        }
    }

    fn delete_port_mapping(&self, external_port: u16, protocol: Protocol) -> Result<(), MappingError> {
        let mut mappings = self.mappings.lock().unwrap();
        let before = mappings.len();
        mappings.retain(|m| !m.matches(external_port, protocol));
        if mappings.len() == before {
            Err(MappingError::Unknown("714 NoSuchEntryInArray".to_string()))
        } else {
            Ok(())
        }
    }

    fn port_mapping_entry(&self, index: u32) -> Result<Option<PortMapping>, MappingError> {
        if !self.listing {
            return Err(MappingError::Unknown("401 Invalid Action".to_string()));
        }
        Ok(self.mappings.lock().unwrap().get(index as usize).cloned())
    }
}

/// Finds the given stub immediately
pub struct StubFinder {
    pub gateway: Arc<StubGateway>,
}

impl GatewayFinder for StubFinder {
    fn find(&self, _timeout: Duration) -> Result<FoundGateway, DiscoveryError> {
        Ok(FoundGateway {
            control: self.gateway.clone(),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            device_count: 1,
        })
    }
}

/// Finds the given stub only after `delay`
pub struct LateFinder {
    pub gateway: Arc<StubGateway>,
    pub delay: Duration,
}

impl GatewayFinder for LateFinder {
    fn find(&self, timeout: Duration) -> Result<FoundGateway, DiscoveryError> {
        std::thread::sleep(self.delay);
        StubFinder { gateway: self.gateway.clone() }.find(timeout)
    }
}

/// No device ever answers; blocks for `delay` before giving up
pub struct SilentFinder {
    pub delay: Duration,
}

impl GatewayFinder for SilentFinder {
    fn find(&self, _timeout: Duration) -> Result<FoundGateway, DiscoveryError> {
        std::thread::sleep(self.delay);
        Err(DiscoveryError::NoDeviceFound)
    }
}

/// Answers every probe with the same result
pub struct FixedProber(pub bool);

impl Prober for FixedProber {
    fn probe(&self, _addr: Ipv4Addr, _timeout: Duration) -> BoxFuture<'_, Result<bool, ProbeError>> {
        let alive = self.0;
        Box::pin(async move { Ok(alive) })
    }
}

pub fn test_config() -> NetworkConfig {
    NetworkConfig {
        discovery_timeout: Duration::from_millis(500),
        probe_timeout: Duration::from_millis(100),
        connect_timeout: Duration::from_millis(500),
        ..NetworkConfig::default()
    }
}

/// Coordinator wired to `gateway`, not yet discovered
pub fn coordinator_with(gateway: Arc<StubGateway>) -> (Coordinator, EventReceiver) {
    Coordinator::new(test_config(), Arc::new(StubFinder { gateway }), Arc::new(FixedProber(true)))
}

/// Coordinator that has discovered `gateway`, with discovery events drained
pub async fn connected_coordinator(gateway: Arc<StubGateway>) -> (Coordinator, EventReceiver) {
    let (coordinator, mut events) = coordinator_with(gateway);
    coordinator.discover().await.unwrap();
    let drained = events.drain();
    assert!(
        drained.iter().any(|e| matches!(e, Event::DiscoverySucceeded { .. })),
        "discovery failed: {:?}",
        drained
    );
    (coordinator, events)
}

/// Receive events up to and including the next terminal one
pub async fn until_terminal(events: &mut EventReceiver) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a terminal event")
    {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            return seen;
        }
    }
    panic!("event channel closed; got {:?}", seen);
}
