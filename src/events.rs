use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::network::PortMapping;

/// Severity of a step-level notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

/// Actionable follow-up a presentation layer may offer after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Remediation {
    /// The gateway refused a third-party LAN target; map to this host and relay instead
    MapToLocalHost,
    /// The external port is taken; pick another one
    ChooseDifferentPort,
    /// The target did not answer; check that it is online and listening
    CheckTargetReachable,
}

/// Everything a background worker reports to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    DiscoveryStarted,
    DiscoverySucceeded {
        gateway: SocketAddr,
        external_ip: IpAddr,
        device_count: usize,
    },
    DiscoveryFailed {
        reason: String,
    },
    OperationSucceeded {
        message: String,
    },
    OperationFailed {
        message: String,
        remediation: Option<Remediation>,
    },
    Notice {
        level: Level,
        message: String,
    },
    ScanCompleted {
        reachable: Vec<Ipv4Addr>,
    },
    MappingsListed {
        mappings: Vec<PortMapping>,
    },
    RelayStarted {
        listen: SocketAddr,
        target: SocketAddr,
    },
    RelayStopped {
        listen: SocketAddr,
    },
    RelayConnection {
        peer: SocketAddr,
        opened: bool,
    },
}

impl Event {
    pub fn notice(level: Level, message: impl Into<String>) -> Self {
        Event::Notice { level, message: message.into() }
    }

    pub fn succeeded(message: impl Into<String>) -> Self {
        Event::OperationSucceeded { message: message.into() }
    }

    pub fn failed(message: impl Into<String>, remediation: Option<Remediation>) -> Self {
        Event::OperationFailed { message: message.into(), remediation }
    }

    /// True for events that end a discovery or operation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::DiscoverySucceeded { .. }
                | Event::DiscoveryFailed { .. }
                | Event::OperationSucceeded { .. }
                | Event::OperationFailed { .. }
                | Event::ScanCompleted { .. }
                | Event::MappingsListed { .. }
        )
    }
}

/// Posting side of the mailbox, cloned into every worker
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Post an event. A closed mailbox only means nobody is listening anymore.
    pub fn post(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            debug!("Event dropped, receiver closed: {:?}", e.0);
        }
    }
}

/// Consuming side of the mailbox, owned by the presentation layer
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Take every event that is pending right now without waiting
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Create a connected sender/receiver pair
pub fn event_bus() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_fifo_and_empties_the_mailbox() {
        let (tx, mut rx) = event_bus();
        tx.post(Event::DiscoveryStarted);
        tx.post(Event::notice(Level::Info, "one"));
        tx.post(Event::succeeded("two"));

        let events = rx.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], Event::DiscoveryStarted);
        assert_eq!(events[2], Event::succeeded("two"));
        assert!(rx.drain().is_empty());
    }

    #[tokio::test]
    async fn posts_from_many_workers_all_arrive() {
        let (tx, mut rx) = event_bus();
        let mut handles = Vec::new();
        for worker in 0..8 {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    tx.post(Event::notice(Level::Info, format!("{}-{}", worker, i)));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        drop(tx);

        let mut per_worker = vec![Vec::new(); 8];
        while let Some(Event::Notice { message, .. }) = rx.recv().await {
            let (worker, i) = message.split_once('-').unwrap();
            per_worker[worker.parse::<usize>().unwrap()].push(i.parse::<usize>().unwrap());
        }
        for seq in per_worker {
            assert_eq!(seq, (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn posting_after_receiver_dropped_is_harmless() {
        let (tx, rx) = event_bus();
        drop(rx);
        tx.post(Event::DiscoveryStarted);
    }
}
