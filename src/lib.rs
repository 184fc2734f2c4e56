//! UPnP port mapping and TCP relaying for a LAN host.
//!
//! [`Coordinator`] is the entry point: it runs each command as a background
//! task and reports progress through an [`EventReceiver`].

pub mod coordinator;
pub mod error;
pub mod events;
pub mod network;
pub mod utils;

pub use coordinator::Coordinator;
pub use events::{Event, EventReceiver, EventSender, Level, Remediation};
pub use network::{NetworkConfig, PortMapping, Protocol};
