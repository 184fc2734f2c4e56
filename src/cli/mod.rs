use clap::{Parser, Subcommand};
use std::time::Duration;

use portbridge::network::{parse_port, NetworkConfig, Protocol};

pub mod commands;
pub mod output;

pub use commands::handle_command;

#[derive(Parser)]
#[command(author, version, about = "Manage UPnP port mappings and relay TCP ports", long_about = None)]
pub struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Print events as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Gateway discovery timeout in milliseconds
    #[arg(long, global = true, default_value_t = 2000)]
    pub discovery_timeout_ms: u64,

    /// Number of subnet addresses probed by `scan`
    #[arg(long, global = true, default_value_t = 20)]
    pub scan_limit: usize,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            discovery_timeout: Duration::from_millis(self.discovery_timeout_ms),
            scan_limit: self.scan_limit,
            ..NetworkConfig::default()
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Find the UPnP gateway and show its external address
    Discover,
    /// List the gateway's port mappings
    List,
    /// Add a port mapping
    Add {
        /// Port opened on the gateway
        #[arg(value_parser = parse_port)]
        external_port: u16,
        /// LAN address traffic is forwarded to
        internal_ip: String,
        #[arg(value_parser = parse_port)]
        internal_port: u16,
        #[arg(short, long, default_value = "TCP")]
        protocol: Protocol,
        #[arg(short, long, default_value = "UPnP Port Mapping")]
        description: String,
    },
    /// Remove a port mapping
    Remove {
        #[arg(value_parser = parse_port)]
        external_port: u16,
        #[arg(short, long, default_value = "TCP")]
        protocol: Protocol,
    },
    /// Check whether an external port is free on the gateway
    Check {
        #[arg(value_parser = parse_port)]
        external_port: u16,
        #[arg(short, long, default_value = "TCP")]
        protocol: Protocol,
    },
    /// Probe the local subnet for reachable hosts
    Scan,
    /// Test reachability of a LAN service
    Test {
        ip: String,
        #[arg(value_parser = parse_port)]
        port: u16,
    },
    /// Relay a local port to another host until interrupted
    Relay {
        #[arg(value_parser = parse_port)]
        listen_port: u16,
        target_ip: String,
        #[arg(value_parser = parse_port)]
        target_port: u16,
    },
    /// Map an external port to this host and relay it to another host
    Forward {
        #[arg(value_parser = parse_port)]
        external_port: u16,
        target_ip: String,
        #[arg(value_parser = parse_port)]
        target_port: u16,
    },
    /// Show addresses that can be used as mapping targets
    Addresses,
}
