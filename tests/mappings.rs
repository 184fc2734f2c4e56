mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;

use common::{connected_coordinator, until_terminal, StubGateway};
use portbridge::events::{Event, Level, Remediation};
use portbridge::{PortMapping, Protocol};

fn existing(port: u16, protocol: Protocol) -> PortMapping {
    PortMapping {
        external_port: port,
        internal_port: port,
        internal_address: Ipv4Addr::new(192, 168, 1, 40),
        protocol,
        description: "existing".to_string(),
        enabled: true,
    }
}

async fn listed(coordinator: &portbridge::Coordinator, events: &mut portbridge::EventReceiver) -> Vec<PortMapping> {
    coordinator.list_mappings().await.unwrap();
    match until_terminal(events).await.pop() {
        Some(Event::MappingsListed { mappings }) => mappings,
        other => panic!("expected a listing, got {:?}", other),
    }
}

#[tokio::test]
async fn add_then_remove_leaves_no_entry() {
    let gateway = Arc::new(StubGateway::new().with_mapping(existing(22, Protocol::Tcp)));
    let (coordinator, mut events) = connected_coordinator(gateway).await;

    coordinator
        .add_mapping(8080, "192.168.1.20", 80, Protocol::Tcp, "web")
        .unwrap()
        .await
        .unwrap();
    assert!(matches!(until_terminal(&mut events).await.pop(), Some(Event::OperationSucceeded { .. })));
    assert!(listed(&coordinator, &mut events).await.iter().any(|m| m.matches(8080, Protocol::Tcp)));

    coordinator.remove_mapping(8080, Protocol::Tcp).unwrap().await.unwrap();
    assert_eq!(
        until_terminal(&mut events).await.pop(),
        Some(Event::succeeded("Port mapping removed: TCP 8080"))
    );

    let remaining = listed(&coordinator, &mut events).await;
    assert!(!remaining.iter().any(|m| m.matches(8080, Protocol::Tcp)));
    assert_eq!(remaining, vec![existing(22, Protocol::Tcp)]);
}

#[tokio::test]
async fn same_port_different_protocol_is_a_different_key() {
    let gateway = Arc::new(
        StubGateway::new()
            .with_mapping(existing(53, Protocol::Tcp))
            .with_mapping(existing(53, Protocol::Udp)),
    );
    let (coordinator, _events) = connected_coordinator(gateway.clone()).await;

    coordinator.session().remove_mapping(53, Protocol::Udp).await.unwrap();

    let found = coordinator.session().find_mapping(53, Protocol::Tcp).await.unwrap();
    assert_eq!(found, Some(existing(53, Protocol::Tcp)));
    assert_eq!(coordinator.session().find_mapping(53, Protocol::Udp).await.unwrap(), None);
}

#[tokio::test]
async fn removing_a_missing_mapping_fails() {
    let gateway = Arc::new(StubGateway::new());
    let (coordinator, mut events) = connected_coordinator(gateway).await;

    coordinator.remove_mapping(9000, Protocol::Tcp).unwrap().await.unwrap();
    assert!(matches!(
        until_terminal(&mut events).await.pop(),
        Some(Event::OperationFailed { .. })
    ));
}

#[tokio::test]
async fn unsupported_listing_reads_as_empty() {
    let gateway = Arc::new(StubGateway::new().without_listing());
    let (coordinator, mut events) = connected_coordinator(gateway).await;

    coordinator.list_mappings().await.unwrap();
    let seen = until_terminal(&mut events).await;
    assert!(matches!(seen[0], Event::Notice { level: Level::Info, .. }));
    assert_eq!(seen.last(), Some(&Event::MappingsListed { mappings: Vec::new() }));
}

#[tokio::test]
async fn check_port_reports_the_current_owner() {
    let gateway = Arc::new(StubGateway::new().with_mapping(existing(8080, Protocol::Tcp)));
    let (coordinator, mut events) = connected_coordinator(gateway.clone()).await;

    coordinator.check_port(8080, Protocol::Tcp).unwrap().await.unwrap();
    match until_terminal(&mut events).await.pop() {
        Some(Event::OperationFailed { message, remediation }) => {
            assert!(message.contains("192.168.1.40:8080"), "{}", message);
            assert_eq!(remediation, Some(Remediation::ChooseDifferentPort));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(gateway.requests().is_empty());
}

#[tokio::test]
async fn check_port_cleans_up_its_probe_mapping() {
    let gateway = Arc::new(StubGateway::new());
    let (coordinator, mut events) = connected_coordinator(gateway.clone()).await;

    coordinator.check_port(7777, Protocol::Udp).unwrap().await.unwrap();
    assert_eq!(
        until_terminal(&mut events).await.pop(),
        Some(Event::succeeded("Port 7777 (UDP) is available"))
    );

    let requests = gateway.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].description, "PortCheck");
    assert_eq!(*requests[0].internal.ip(), Ipv4Addr::LOCALHOST);
    assert!(gateway.mappings().is_empty());
}
