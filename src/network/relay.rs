use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::addresses::tcp_connect;
use super::NetworkConfig;
use crate::error::RelayError;
use crate::events::{Event, EventSender, Level};

/// Pause after a failed accept, e.g. when the process is out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts TCP connections on a local port and pipes each one to a fixed target
#[derive(Debug, Clone)]
pub struct RelayServer {
    buffer_size: usize,
    connect_timeout: Duration,
    events: EventSender,
}

/// A running relay listener.
///
/// Dropping the handle stops the listener just like [`RelayHandle::stop`],
/// without waiting for it to close.
#[derive(Debug)]
pub struct RelayHandle {
    local_addr: SocketAddr,
    target: SocketAddr,
    active: Arc<AtomicUsize>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Relayed connections currently open, including ones accepted before a stop
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Close the listening socket. Connections already relayed keep running.
    ///
    /// Returns once the socket is closed.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!("Relay accept loop on {} ended abnormally: {}", self.local_addr, e);
        }
    }
}

impl RelayServer {
    pub fn new(config: &NetworkConfig, events: EventSender) -> Self {
        Self {
            buffer_size: config.relay_buffer_size.max(1),
            connect_timeout: config.connect_timeout,
            events,
        }
    }

    /// Bind `listen` and start relaying every accepted connection to `target`
    pub async fn start(&self, listen: SocketAddr, target: SocketAddr) -> Result<RelayHandle, RelayError> {
        let bind_failed = |e: io::Error| RelayError::BindFailed {
            addr: listen,
            reason: e.to_string(),
        };

        debug!("Binding relay listener to {}", listen);
        let listener = TcpListener::bind(listen).await.map_err(bind_failed)?;
        let local_addr = listener.local_addr().map_err(bind_failed)?;
        info!("Relay listening on {} -> {}", local_addr, target);

        let active = Arc::new(AtomicUsize::new(0));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            local_addr,
            target,
            self.clone(),
            Arc::clone(&active),
            shutdown_rx,
        ));

        self.events.post(Event::RelayStarted {
            listen: local_addr,
            target,
        });

        Ok(RelayHandle {
            local_addr,
            target,
            active,
            shutdown,
            task,
        })
    }
}

/// Source of inbound connections for [`accept_loop`]
trait Acceptor: Send + Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

async fn accept_loop<A: Acceptor>(
    listener: A,
    listen: SocketAddr,
    target: SocketAddr,
    relay: RelayServer,
    active: Arc<AtomicUsize>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let (inbound, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept relay connection on {}: {}", listen, e);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            },
        };
        debug!("Accepted relay connection from {}", peer);

        let outbound = tokio::select! {
            _ = &mut shutdown => break,
            connected = tcp_connect(target, relay.connect_timeout) => connected,
        };

        match outbound {
            Ok(outbound) => {
                tokio::spawn(relay_connection(
                    inbound,
                    outbound,
                    peer,
                    target,
                    relay.buffer_size,
                    relay.events.clone(),
                    ConnectionGuard::new(Arc::clone(&active)),
                ));
            }
            Err(e) => {
                // Closing the accepted side is all the client gets
                drop(inbound);
                let error = RelayError::TargetUnreachable {
                    addr: target,
                    reason: e.to_string(),
                };
                warn!("Dropping relay connection from {}: {}", peer, error);
                relay.events.post(Event::notice(Level::Error, format!("{} (client {})", error, peer)));
            }
        }
    }

    drop(listener);
    info!("Relay on {} stopped accepting connections", listen);
    relay.events.post(Event::RelayStopped { listen });
}

/// Counts a connection as active for as long as it lives
struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn relay_connection(
    inbound: TcpStream,
    outbound: TcpStream,
    peer: SocketAddr,
    target: SocketAddr,
    buffer_size: usize,
    events: EventSender,
    _guard: ConnectionGuard,
) {
    let id = Uuid::new_v4();
    info!("Relay session {} opened: {} <-> {}", id, peer, target);
    events.post(Event::RelayConnection { peer, opened: true });

    let (mut client_read, mut client_write) = inbound.into_split();
    let (mut target_read, mut target_write) = outbound.into_split();

    // Whichever direction ends first ends both; no half-open connections
    let (direction, result) = tokio::select! {
        r = pump(&mut client_read, &mut target_write, buffer_size) => ("client -> target", r),
        r = pump(&mut target_read, &mut client_write, buffer_size) => ("target -> client", r),
    };

    match result {
        Ok(bytes) => debug!("Relay session {} closed by {} after {} bytes", id, direction, bytes),
        Err(e) => debug!("Relay session {} {} failed: {}", id, direction, e),
    }

    drop((client_read, client_write, target_read, target_write));
    info!("Relay session {} closed: {}", id, peer);
    events.post(Event::RelayConnection { peer, opened: false });
}

/// Copy from `reader` to `writer` until EOF or the first error; returns bytes copied
async fn pump<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pump_copies_until_eof() {
        let (mut src_tx, mut src_rx) = duplex(64);
        let (mut dst_tx, mut dst_rx) = duplex(64);

        src_tx.write_all(b"hello relay").await.unwrap();
        drop(src_tx);

        let copied = pump(&mut src_rx, &mut dst_tx, 4).await.unwrap();
        assert_eq!(copied, 11);
        drop(dst_tx);

        let mut out = Vec::new();
        dst_rx.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello relay");
    }

    #[tokio::test]
    async fn pump_stops_on_write_error() {
        let (mut src_tx, mut src_rx) = duplex(64);
        let (mut dst_tx, dst_rx) = duplex(64);
        drop(dst_rx);

        src_tx.write_all(b"data").await.unwrap();
        let result = pump(&mut src_rx, &mut dst_tx, 16).await;
        assert!(result.is_err());
    }

    /// Fails the first `failures` accepts, then hands out `inner`'s connections
    struct FlakyAcceptor {
        failures: usize,
        attempts: Arc<AtomicUsize>,
        inner: Option<TcpListener>,
    }

    impl Acceptor for FlakyAcceptor {
        fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < self.failures {
                    return Err(io::Error::other("Too many open files"));
                }
                match &self.inner {
                    Some(listener) => listener.accept().await,
                    None => std::future::pending().await,
                }
            }
        }
    }

    fn test_relay() -> (RelayServer, crate::events::EventReceiver) {
        let (events, rx) = crate::events::event_bus();
        (RelayServer::new(&NetworkConfig::default(), events), rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accept_errors_back_off_and_shutdown_still_works() {
        let (relay, mut rx) = test_relay();
        let attempts = Arc::new(AtomicUsize::new(0));
        let acceptor = FlakyAcceptor {
            failures: usize::MAX,
            attempts: Arc::clone(&attempts),
            inner: None,
        };
        let listen: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            acceptor,
            listen,
            "127.0.0.1:9".parse().unwrap(),
            relay,
            Arc::new(AtomicUsize::new(0)),
            shutdown_rx,
        ));

        time::sleep(Duration::from_millis(250)).await;
        let seen = attempts.load(Ordering::SeqCst);
        assert!((2..=5).contains(&seen), "{} accept attempts in 250ms", seen);

        shutdown.send(()).unwrap();
        time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(rx.drain(), vec![Event::RelayStopped { listen }]);
    }

    #[tokio::test]
    async fn connections_are_relayed_after_accept_errors() {
        let (relay, _rx) = test_relay();
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let (mut read, mut write) = stream.split();
            tokio::io::copy(&mut read, &mut write).await.unwrap();
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let acceptor = FlakyAcceptor {
            failures: 2,
            attempts: Arc::clone(&attempts),
            inner: Some(listener),
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            acceptor,
            listen,
            target,
            relay,
            Arc::new(AtomicUsize::new(0)),
            shutdown_rx,
        ));

        let mut client = TcpStream::connect(listen).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        time::timeout(Duration::from_secs(2), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"ping");
        assert!(attempts.load(Ordering::SeqCst) >= 3);

        shutdown.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn binding_an_occupied_address_fails() {
        let (events, _rx) = crate::events::event_bus();
        let relay = RelayServer::new(&NetworkConfig::default(), events);
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let first = relay.start("127.0.0.1:0".parse().unwrap(), target).await.unwrap();
        let second = relay.start(first.local_addr(), target).await;
        assert!(matches!(second, Err(RelayError::BindFailed { .. })));

        first.stop().await;
    }
}
