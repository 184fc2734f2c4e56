use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use igd_next::{
    AddPortError, GetExternalIpError, GetGenericPortMappingEntryError, PortMappingProtocol, RemovePortError,
    RequestError, SearchError, SearchOptions,
};
use tracing::{debug, warn};

use super::gateway::{ControlPoint, FoundGateway, GatewayFinder, MappingRequest};
use super::{PortMapping, Protocol};
use crate::error::{DiscoveryError, MappingError};

/// Timeout for a single SOAP request sent outside of igd-next
const SOAP_TIMEOUT: Duration = Duration::from_secs(5);

const WANIP_SERVICE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
const WANPPP_SERVICE: &str = "urn:schemas-upnp-org:service:WANPPPConnection:1";

impl From<Protocol> for PortMappingProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => PortMappingProtocol::TCP,
            Protocol::Udp => PortMappingProtocol::UDP,
        }
    }
}

impl From<PortMappingProtocol> for Protocol {
    fn from(protocol: PortMappingProtocol) -> Self {
        match protocol {
            PortMappingProtocol::TCP => Protocol::Tcp,
            PortMappingProtocol::UDP => Protocol::Udp,
        }
    }
}

impl From<RequestError> for MappingError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::ErrorCode(code, description) => MappingError::from_fault_code(code, &description),
            RequestError::IoError(e) => MappingError::Unreachable(e.to_string()),
            RequestError::AttoHttpError(e) => MappingError::Unreachable(e.to_string()),
            other => MappingError::Unknown(other.to_string()),
        }
    }
}

impl From<AddPortError> for MappingError {
    fn from(err: AddPortError) -> Self {
        match err {
            AddPortError::RequestError(e) => e.into(),
            AddPortError::PortInUse => MappingError::Conflict(err.to_string()),
            AddPortError::InternalPortZeroInvalid
            | AddPortError::ExternalPortZeroInvalid
            | AddPortError::SamePortValuesRequired
            | AddPortError::OnlyPermanentLeasesSupported
            | AddPortError::DescriptionTooLong => MappingError::InvalidArgs(err.to_string()),
            AddPortError::ActionNotAuthorized => MappingError::Unknown(err.to_string()),
        }
    }
}

impl From<RemovePortError> for MappingError {
    fn from(err: RemovePortError) -> Self {
        match err {
            RemovePortError::RequestError(e) => e.into(),
            RemovePortError::NoSuchPortMapping | RemovePortError::ActionNotAuthorized => {
                MappingError::Unknown(err.to_string())
            }
        }
    }
}

impl From<GetExternalIpError> for MappingError {
    fn from(err: GetExternalIpError) -> Self {
        match err {
            GetExternalIpError::RequestError(e) => e.into(),
            GetExternalIpError::ActionNotAuthorized => MappingError::Unknown(err.to_string()),
        }
    }
}

impl From<GetGenericPortMappingEntryError> for MappingError {
    fn from(err: GetGenericPortMappingEntryError) -> Self {
        match err {
            GetGenericPortMappingEntryError::RequestError(e) => e.into(),
            other => MappingError::Unknown(other.to_string()),
        }
    }
}

/// SSDP search through igd-next; selects the first gateway that answers
#[derive(Debug, Clone, Default)]
pub struct IgdFinder {
    /// Local address to search from, igd-next's default when unset
    pub bind_addr: Option<SocketAddr>,
}

impl GatewayFinder for IgdFinder {
    fn find(&self, timeout: Duration) -> Result<FoundGateway, DiscoveryError> {
        let mut options = SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        };
        if let Some(bind_addr) = self.bind_addr {
            options.bind_addr = bind_addr;
        }

        debug!("Searching for UPnP IGD gateway...");
        let gateway = igd_next::search_gateway(options).map_err(|e| {
            debug!("UPnP gateway search failed: {}", e);
            classify_search_error(e)
        })?;
        debug!("Found UPnP gateway at {}", gateway.addr);

        let control_addr = gateway.addr;
        Ok(FoundGateway {
            control: Arc::new(IgdControlPoint::new(gateway)),
            control_addr,
            // igd-next stops at the first valid responder
            device_count: 1,
        })
    }
}

fn classify_search_error(error: SearchError) -> DiscoveryError {
    match error {
        SearchError::NoResponseWithinTimeout => DiscoveryError::NoDeviceFound,
        SearchError::IoError(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            DiscoveryError::NoDeviceFound
        }
        other => DiscoveryError::SelectionFailed(other.to_string()),
    }
}

/// [`ControlPoint`] backed by an igd-next gateway
pub struct IgdControlPoint {
    gateway: igd_next::Gateway,
}

impl IgdControlPoint {
    pub fn new(gateway: igd_next::Gateway) -> Self {
        Self { gateway }
    }

    fn service_type(&self) -> &'static str {
        if self.gateway.control_url.to_ascii_uppercase().contains("PPP") {
            WANPPP_SERVICE
        } else {
            WANIP_SERVICE
        }
    }

    /// AddPortMapping with an explicit NewRemoteHost, which igd-next always sends empty
    fn add_port_mapping_with_remote_host(&self, request: &MappingRequest) -> Result<(), MappingError> {
        let service = self.service_type();
        let url = format!("http://{}{}", self.gateway.addr, self.gateway.control_url);
        let body = add_port_mapping_envelope(service, request);

        let client = reqwest::blocking::Client::builder()
            .timeout(SOAP_TIMEOUT)
            .build()
            .map_err(|e| MappingError::Unknown(e.to_string()))?;

        let response = client
            .post(&url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#AddPortMapping\"", service))
            .body(body)
            .send()
            .map_err(|e| MappingError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().unwrap_or_default();
        let code = xml_text(&text, "errorCode").unwrap_or_default();
        let description = xml_text(&text, "errorDescription").unwrap_or_default();
        warn!("AddPortMapping via {} returned {}: {} {}", url, status, code, description);

        Err(soap_fault(&code, &description, status.as_u16()))
    }
}

impl ControlPoint for IgdControlPoint {
    fn external_ip(&self) -> Result<IpAddr, MappingError> {
        Ok(self.gateway.get_external_ip()?)
    }

    fn add_port_mapping(&self, request: &MappingRequest) -> Result<(), MappingError> {
        if !request.remote_host.is_empty() {
            return self.add_port_mapping_with_remote_host(request);
        }

        self.gateway
            .add_port(
                request.protocol.into(),
                request.external_port,
                SocketAddr::V4(request.internal),
                request.lease_duration,
                &request.description,
            )
            .map_err(MappingError::from)
    }

    fn delete_port_mapping(&self, external_port: u16, protocol: Protocol) -> Result<(), MappingError> {
        Ok(self.gateway.remove_port(protocol.into(), external_port)?)
    }

    fn port_mapping_entry(&self, index: u32) -> Result<Option<PortMapping>, MappingError> {
        let entry = match self.gateway.get_generic_port_mapping_entry(index) {
            Ok(entry) => entry,
            Err(GetGenericPortMappingEntryError::SpecifiedArrayIndexInvalid) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let internal_address = entry.internal_client.parse().unwrap_or_else(|_| {
            debug!("Mapping {} has non-IPv4 internal client {:?}", index, entry.internal_client);
            Ipv4Addr::UNSPECIFIED
        });

        Ok(Some(PortMapping {
            external_port: entry.external_port,
            internal_port: entry.internal_port,
            internal_address,
            protocol: entry.protocol.into(),
            description: entry.port_mapping_description,
            enabled: entry.enabled,
        }))
    }
}

/// Error for a failed hand-built SOAP call. The fault code is used when the body carries one.
fn soap_fault(code: &str, description: &str, status: u16) -> MappingError {
    match code.trim().parse::<u16>() {
        Ok(code) => MappingError::from_fault_code(code, description),
        Err(_) if description.is_empty() => MappingError::Unknown(format!("HTTP {}", status)),
        Err(_) => MappingError::classify(description),
    }
}

fn add_port_mapping_envelope(service: &str, request: &MappingRequest) -> String {
    format!(
        "<?xml version=\"1.0\"?>\
<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
<s:Body>\
<u:AddPortMapping xmlns:u=\"{service}\">\
<NewRemoteHost>{remote_host}</NewRemoteHost>\
<NewExternalPort>{external_port}</NewExternalPort>\
<NewProtocol>{protocol}</NewProtocol>\
<NewInternalPort>{internal_port}</NewInternalPort>\
<NewInternalClient>{internal_client}</NewInternalClient>\
<NewEnabled>1</NewEnabled>\
<NewPortMappingDescription>{description}</NewPortMappingDescription>\
<NewLeaseDuration>{lease}</NewLeaseDuration>\
</u:AddPortMapping>\
</s:Body>\
</s:Envelope>",
        service = service,
        remote_host = xml_escape(&request.remote_host),
        external_port = request.external_port,
        protocol = request.protocol,
        internal_port = request.internal.port(),
        internal_client = request.internal.ip(),
        description = xml_escape(&request.description),
        lease = request.lease_duration,
    )
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Text of the first `<tag>` element, ignoring namespaces on the fault body
fn xml_text(document: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = document.find(&open)? + open.len();
    let end = start + document[start..].find(&close)?;
    Some(document[start..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    #[test]
    fn envelope_carries_remote_host_and_escapes_text() {
        let mut request = MappingRequest::new(
            8080,
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 7), 80),
            Protocol::Tcp,
            "Tom & Jerry <web>",
        );
        request.remote_host = "0".to_string();

        let body = add_port_mapping_envelope(WANIP_SERVICE, &request);
        assert!(body.contains("<NewRemoteHost>0</NewRemoteHost>"));
        assert!(body.contains("<NewExternalPort>8080</NewExternalPort>"));
        assert!(body.contains("<NewProtocol>TCP</NewProtocol>"));
        assert!(body.contains("<NewInternalClient>192.168.0.7</NewInternalClient>"));
        assert!(body.contains("Tom &amp; Jerry &lt;web&gt;"));
        assert!(body.contains(WANIP_SERVICE));
    }

    #[test]
    fn fault_fields_are_extracted() {
        let fault = "<s:Fault><detail><UPnPError><errorCode>402</errorCode>\
                     <errorDescription>Invalid Args</errorDescription></UPnPError></detail></s:Fault>";
        assert_eq!(xml_text(fault, "errorCode").as_deref(), Some("402"));
        assert_eq!(xml_text(fault, "errorDescription").as_deref(), Some("Invalid Args"));
        assert_eq!(xml_text(fault, "missing"), None);
    }

    #[test]
    fn search_timeouts_mean_no_device() {
        assert_eq!(
            classify_search_error(SearchError::NoResponseWithinTimeout),
            DiscoveryError::NoDeviceFound
        );
        let would_block = io::Error::new(io::ErrorKind::WouldBlock, "resource busy");
        assert_eq!(classify_search_error(SearchError::IoError(would_block)), DiscoveryError::NoDeviceFound);

        assert!(matches!(
            classify_search_error(SearchError::InvalidResponse),
            DiscoveryError::SelectionFailed(_)
        ));
    }

    #[test]
    fn gateway_errors_keep_their_kind() {
        assert!(matches!(MappingError::from(AddPortError::PortInUse), MappingError::Conflict(_)));
        assert!(matches!(
            MappingError::from(AddPortError::DescriptionTooLong),
            MappingError::InvalidArgs(_)
        ));
        assert!(matches!(
            MappingError::from(AddPortError::RequestError(RequestError::ErrorCode(402, "Invalid Args".to_string()))),
            MappingError::InvalidArgs(_)
        ));
        assert!(matches!(
            MappingError::from(RequestError::ErrorCode(501, "ActionFailed on port 14020".to_string())),
            MappingError::Unknown(_)
        ));
        assert!(matches!(
            MappingError::from(RemovePortError::RequestError(RequestError::IoError(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused"
            )))),
            MappingError::Unreachable(_)
        ));
        assert!(matches!(
            MappingError::from(GetExternalIpError::ActionNotAuthorized),
            MappingError::Unknown(_)
        ));
    }

    #[test]
    fn soap_faults_use_the_whole_code() {
        assert!(matches!(soap_fault("402", "Invalid Args", 500), MappingError::InvalidArgs(_)));
        assert!(matches!(soap_fault("718", "ConflictInMappingEntry", 500), MappingError::Conflict(_)));
        assert!(matches!(soap_fault("4020", "Vendor fault", 500), MappingError::Unknown(_)));
        assert_eq!(soap_fault("", "", 503), MappingError::Unknown("HTTP 503".to_string()));
    }

    #[test]
    fn protocol_conversion_round_trips() {
        assert_eq!(Protocol::from(PortMappingProtocol::from(Protocol::Udp)), Protocol::Udp);
    }
}
