use std::net::Ipv4Addr;

use portbridge::events::{Event, Level, Remediation};
use portbridge::network::PortMapping;

/// Print one event, as a JSON line or as text
pub fn print_event(event: &Event, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to encode event: {}", e),
        }
        return;
    }

    match event {
        Event::DiscoveryStarted => println!("Discovering UPnP devices..."),
        Event::DiscoverySucceeded { gateway, external_ip, device_count } => println!(
            "Connected to gateway {} (external IP {}, {} device(s) found)",
            gateway, external_ip, device_count
        ),
        Event::DiscoveryFailed { reason } => println!("Discovery failed: {}", reason),
        Event::OperationSucceeded { message } => println!("[OK] {}", message),
        Event::OperationFailed { message, remediation } => {
            println!("[FAILED] {}", message);
            if let Some(hint) = remediation {
                println!("  hint: {}", remediation_hint(*hint));
            }
        }
        Event::Notice { level, message } => println!("{} {}", level_tag(*level), message),
        Event::ScanCompleted { reachable } => print_scan(reachable),
        Event::MappingsListed { mappings } => print_mappings(mappings),
        Event::RelayStarted { listen, target } => println!("Relay listening on {} -> {}", listen, target),
        Event::RelayStopped { listen } => println!("Relay on {} stopped", listen),
        Event::RelayConnection { peer, opened } => {
            if *opened {
                println!("Relay connection from {}", peer);
            } else {
                println!("Relay connection from {} closed", peer);
            }
        }
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Info => "[INFO]",
        Level::Success => "[OK]",
        Level::Warning => "[WARN]",
        Level::Error => "[ERROR]",
    }
}

fn remediation_hint(remediation: Remediation) -> &'static str {
    match remediation {
        Remediation::MapToLocalHost => {
            "the gateway only maps to this host; try `forward` to relay through it"
        }
        Remediation::ChooseDifferentPort => "the port is in use; choose a different external port",
        Remediation::CheckTargetReachable => "check that the target is online and the service is listening",
    }
}

fn print_scan(reachable: &[Ipv4Addr]) {
    println!("Scan complete: {} reachable host(s)", reachable.len());
    for ip in reachable {
        println!("  {}", ip);
    }
}

fn print_mappings(mappings: &[PortMapping]) {
    if mappings.is_empty() {
        println!("No port mappings");
        return;
    }

    println!("{:<6} {:>8}  {:<21} {:<8} {}", "PROTO", "EXTERNAL", "INTERNAL", "STATE", "DESCRIPTION");
    for m in mappings {
        println!(
            "{:<6} {:>8}  {:<21} {:<8} {}",
            m.protocol.to_string(),
            m.external_port,
            format!("{}:{}", m.internal_address, m.internal_port),
            if m.enabled { "enabled" } else { "disabled" },
            m.description
        );
    }
}
