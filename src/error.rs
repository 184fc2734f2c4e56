use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use serde::Serialize;
use thiserror::Error;

use crate::events::Remediation;
use crate::network::AttemptStrategy;

/// Malformed input rejected before any network call is made
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Port must not be zero")]
    ZeroPort,

    #[error("Unsupported protocol: {0}")]
    InvalidProtocol(String),

    #[error("{0} relaying is not supported")]
    UnsupportedRelayProtocol(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("No UPnP device found")]
    NoDeviceFound,

    #[error("Failed to select an Internet Gateway Device: {0}")]
    SelectionFailed(String),
}

/// Failure reported by the gateway (or by the attempt to reach it)
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
pub enum MappingError {
    #[error("Not connected to a UPnP gateway")]
    NoGateway,

    #[error("{0}")]
    InvalidArgs(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Gateway unreachable: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Unknown(String),
}

impl MappingError {
    /// Map a UPnP fault code to the failure taxonomy, falling back to the description text
    pub fn from_fault_code(code: u16, description: &str) -> Self {
        let raw = format!("{} {}", code, description).trim().to_string();
        match code {
            // Invalid Args, Argument Value Invalid / Out of Range, and the IGD argument faults
            402 | 600 | 601 | 716 | 724 | 725 | 726 | 727 => MappingError::InvalidArgs(raw),
            // ConflictInMappingEntry, NoPortMapsAvailable, ConflictWithOtherMechanisms
            718 | 728 | 729 => MappingError::Conflict(raw),
            _ => match MappingError::classify_text(description) {
                MappingError::Unknown(_) => MappingError::Unknown(raw),
                classified => classified.with_message(raw),
            },
        }
    }

    /// Sort a raw fault message into the failure taxonomy.
    ///
    /// A leading numeric token is read as a UPnP fault code; the rest is
    /// matched by fault name, never by digits inside the text.
    pub fn classify(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let trimmed = raw.trim();
        let (head, rest) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));

        match head.trim_end_matches(':').parse::<u16>() {
            Ok(code) => MappingError::from_fault_code(code, rest.trim()),
            Err(_) => MappingError::classify_text(&raw),
        }
    }

    fn classify_text(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();

        if lower.contains("invalid args") || lower.contains("invalidargs") {
            MappingError::InvalidArgs(raw.to_string())
        } else if lower.contains("conflict") || lower.contains("in use") {
            MappingError::Conflict(raw.to_string())
        } else if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection refused")
            || lower.contains("unreachable")
        {
            MappingError::Unreachable(raw.to_string())
        } else {
            MappingError::Unknown(raw.to_string())
        }
    }

    fn with_message(self, message: String) -> Self {
        match self {
            MappingError::NoGateway => MappingError::NoGateway,
            MappingError::InvalidArgs(_) => MappingError::InvalidArgs(message),
            MappingError::Conflict(_) => MappingError::Conflict(message),
            MappingError::Unreachable(_) => MappingError::Unreachable(message),
            MappingError::Unknown(_) => MappingError::Unknown(message),
        }
    }

    pub fn is_invalid_args(&self) -> bool {
        matches!(self, MappingError::InvalidArgs(_))
    }
}

/// One failed step of the add-mapping fallback chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub strategy: AttemptStrategy,
    pub error: MappingError,
}

/// Composite error of the add-mapping fallback chain.
///
/// `error` always carries the reason of the first attempt, whichever attempt
/// failed last.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("All methods failed. Primary error: {error}")]
pub struct AddMappingFailure {
    pub error: MappingError,
    pub attempts: Vec<AttemptFailure>,
    pub remediation: Option<Remediation>,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind relay listener on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("Relay target {addr} unreachable: {reason}")]
    TargetUnreachable { addr: SocketAddr, reason: String },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("No route to {0}")]
    Unresolvable(Ipv4Addr),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
