//! A single outbound connection run by its own reactor thread.
//!
//! Grounded on `flux-network`'s single-thread-per-connection pattern
//! (see `ConnectionManager` in the teacher's `tcp/connector.rs`), reduced
//! to the one-peer case spec.md asks for: no registry, no acceptor, just
//! a connect, a handshake, and the read/write pumps.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, net::TcpStream};
use tether_queue::{BlockingQueue, Message, MessageKind};
use tether_utils::{ThreadPriority, thread_boot};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnState, ConnectionHandle, ConnectionIo, DEFAULT_MAX_BODY_SIZE, OwnedMessage},
    error::ConnectError,
};

const POLL_TIMEOUT: Duration = Duration::from_millis(20);
const CLIENT_TOKEN: Token = Token(0);

/// Configuration accepted by [`Client::connect`]. Construct with
/// [`ClientConfig::default`] and adjust the fields you care about —
/// mirrors the teacher's plain-struct config style rather than a
/// builder, since there are only two knobs.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub max_body_size: usize,
    pub core: Option<usize>,
    pub priority: ThreadPriority,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { max_body_size: DEFAULT_MAX_BODY_SIZE, core: None, priority: ThreadPriority::OSDefault }
    }
}

/// Builds a [`Client`] and connects it in one step, mirroring
/// [`crate::server::ServerBuilder`] for applications that want the same
/// chained-setter feel on both ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_body_size(mut self, max: usize) -> Self {
        self.config.max_body_size = max;
        self
    }

    pub fn thread_affinity(mut self, core: Option<usize>, priority: ThreadPriority) -> Self {
        self.config.core = core;
        self.config.priority = priority;
        self
    }

    pub fn connect<T: MessageKind>(self, host: &str, port: u16) -> Result<Client<T>, ConnectError> {
        let mut client = Client::new(self.config);
        client.connect(host, port)?;
        Ok(client)
    }
}

/// A connection to one server, driven by a private reactor thread.
///
/// `Client` itself is the application-thread handle: `send` and
/// `incoming` are safe to call from any thread, including while the
/// reactor thread is mid-poll.
pub struct Client<T: MessageKind> {
    config: ClientConfig,
    reactor: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<Arc<ConnectionHandle<T>>>,
    incoming: Arc<BlockingQueue<OwnedMessage<T>>>,
}

impl<T: MessageKind> Client<T> {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            reactor: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
            incoming: Arc::new(BlockingQueue::new()),
        }
    }

    /// Resolves `host:port`, connects, and spawns the reactor thread that
    /// runs the handshake and then the read/write pumps for the lifetime
    /// of the connection. Returns once the socket is registered — the
    /// handshake itself completes asynchronously.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        let addr = resolve_one(host, port)?;

        let mut stream = TcpStream::connect(addr).map_err(|source| ConnectError::Connect { addr, source })?;
        if let Ok(Some(source)) = stream.take_error() {
            return Err(ConnectError::Connect { addr, source });
        }

        let mut poll = Poll::new().map_err(|source| ConnectError::Connect { addr, source })?;
        poll.registry()
            .register(&mut stream, CLIENT_TOKEN, Interest::READABLE | Interest::WRITABLE)
            .map_err(|source| ConnectError::Connect { addr, source })?;

        let handle = ConnectionHandle::new(0, addr);
        let conn = ConnectionIo::new_client(stream, CLIENT_TOKEN, handle.clone(), self.config.max_body_size);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let incoming = self.incoming.clone();
        let sf = stop_flag.clone();
        let cfg = self.config;
        let reactor = thread::Builder::new()
            .name("tether-client".into())
            .spawn(move || {
                thread_boot(cfg.core, cfg.priority);
                reactor_loop(poll, conn, incoming, sf);
            })
            .expect("spawn tether-client reactor thread");

        self.handle = Some(handle);
        self.stop_flag = stop_flag;
        self.reactor = Some(reactor);
        info!(%addr, "tether: client connecting");
        Ok(())
    }

    /// Signals the reactor thread to close the socket and exit, then
    /// joins it. Idempotent: calling this with no active connection is a
    /// no-op.
    pub fn disconnect(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.join();
        }
        self.handle = None;
    }

    pub fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_connected())
    }

    /// Enqueues `msg` for the write pump. Silently dropped if there is no
    /// live connection — callers that care should check
    /// [`Client::is_connected`] first.
    pub fn send(&self, msg: Message<T>) {
        match &self.handle {
            Some(handle) if handle.is_connected() => handle.send(msg),
            _ => debug!("tether: send on a disconnected client, dropping message"),
        }
    }

    pub fn incoming(&self) -> &BlockingQueue<OwnedMessage<T>> {
        &self.incoming
    }
}

impl<T: MessageKind> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr, ConnectError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ConnectError::Resolve { host: host.to_owned(), port, source })?;
    addrs.next().ok_or_else(|| ConnectError::NoAddresses { host: host.to_owned(), port })
}

fn reactor_loop<T: MessageKind>(
    mut poll: Poll,
    mut conn: ConnectionIo<T>,
    incoming: Arc<BlockingQueue<OwnedMessage<T>>>,
    stop_flag: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(16);
    loop {
        if stop_flag.load(Ordering::Acquire) {
            conn.close(poll.registry());
            return;
        }
        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(?err, "tether: client poll error");
                continue;
            }
        }
        for event in events.iter() {
            if conn.on_event(event, poll.registry(), &incoming) == ConnState::Disconnected {
                debug!("tether: client connection closed");
                return;
            }
        }
        if conn.tick(poll.registry()) == ConnState::Disconnected {
            return;
        }
    }
}
