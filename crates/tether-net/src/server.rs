//! Accepts connections, runs one handshake + read/write pump per client,
//! and exposes a registry the application drains from any thread.
//!
//! Grounded on `flux-network`'s `ConnectionManager`/`TcpConnector` accept
//! loop (`tcp/connector.rs`), narrowed from flux's N-listener fan-out to
//! the single-listener server spec.md describes, and on the original
//! source's `net_server.h` for the admission-hook shape (`OnClientConnect`
//! veto, monotonic id assignment starting at 10000, `OnClientValidated`).

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use tether_queue::{BlockingQueue, Message, MessageKind};
use tether_utils::{ThreadPriority, thread_boot};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnState, ConnectionHandle, ConnectionIo, DEFAULT_MAX_BODY_SIZE, OwnedMessage, new_server_nonce},
    error::BindError,
};

const POLL_TIMEOUT: Duration = Duration::from_millis(20);
const LISTENER_TOKEN: Token = Token(0);
const FIRST_CONNECTION_ID: u32 = 10_000;

type ConnectHook<T> = dyn Fn(&Arc<ConnectionHandle<T>>) -> bool + Send + Sync;
type ValidatedHook<T> = dyn Fn(&Arc<ConnectionHandle<T>>) + Send + Sync;
type MessageHook<T> = dyn Fn(&Arc<ConnectionHandle<T>>, Message<T>) + Send + Sync;
type DisconnectHook<T> = dyn Fn(&Arc<ConnectionHandle<T>>) + Send + Sync;

/// Builds a [`Server`] with the admission hooks wired in up front —
/// mirrors the teacher's `TcpConnector::with_*` builder style in
/// `connector.rs`.
pub struct ServerBuilder<T: MessageKind> {
    bind_addr: IpAddr,
    max_body_size: usize,
    core: Option<usize>,
    priority: ThreadPriority,
    on_client_connect: Arc<ConnectHook<T>>,
    on_client_validated: Arc<ValidatedHook<T>>,
    on_message: Arc<MessageHook<T>>,
    on_client_disconnect: Arc<DisconnectHook<T>>,
}

impl<T: MessageKind> Default for ServerBuilder<T> {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            core: None,
            priority: ThreadPriority::OSDefault,
            on_client_connect: Arc::new(|_| true),
            on_client_validated: Arc::new(|_| {}),
            on_message: Arc::new(|_, _| {}),
            on_client_disconnect: Arc::new(|_| {}),
        }
    }
}

impl<T: MessageKind> ServerBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }

    pub fn thread_affinity(mut self, core: Option<usize>, priority: ThreadPriority) -> Self {
        self.core = core;
        self.priority = priority;
        self
    }

    /// Admission veto, run on the reactor thread right after `accept()`
    /// succeeds and before any id is assigned or handshake begun.
    /// Returning `false` drops the socket immediately.
    pub fn on_client_connect(mut self, hook: impl Fn(&Arc<ConnectionHandle<T>>) -> bool + Send + Sync + 'static) -> Self {
        self.on_client_connect = Arc::new(hook);
        self
    }

    /// Run on the reactor thread once the handshake completes, before the
    /// read pump accepts any framed traffic from this client.
    pub fn on_client_validated(mut self, hook: impl Fn(&Arc<ConnectionHandle<T>>) + Send + Sync + 'static) -> Self {
        self.on_client_validated = Arc::new(hook);
        self
    }

    /// Run on the application thread that calls [`Server::update`], once
    /// per dequeued message.
    pub fn on_message(mut self, hook: impl Fn(&Arc<ConnectionHandle<T>>, Message<T>) + Send + Sync + 'static) -> Self {
        self.on_message = Arc::new(hook);
        self
    }

    /// Run on the application thread, from [`Server::message_client`] /
    /// [`Server::message_all_clients`], when a send targets a connection
    /// that has gone dead.
    pub fn on_client_disconnect(mut self, hook: impl Fn(&Arc<ConnectionHandle<T>>) + Send + Sync + 'static) -> Self {
        self.on_client_disconnect = Arc::new(hook);
        self
    }

    pub fn start(self, port: u16) -> Result<Server<T>, BindError> {
        Server::start(self, port)
    }
}

/// A listening server: one reactor thread running the acceptor plus one
/// read/write pump per admitted client.
pub struct Server<T: MessageKind> {
    reactor: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
    registry: Arc<Mutex<Vec<Arc<ConnectionHandle<T>>>>>,
    incoming: Arc<BlockingQueue<OwnedMessage<T>>>,
    on_message: Arc<MessageHook<T>>,
    on_client_disconnect: Arc<DisconnectHook<T>>,
    local_addr: SocketAddr,
}

impl<T: MessageKind> Server<T> {
    pub fn builder() -> ServerBuilder<T> {
        ServerBuilder::default()
    }

    fn start(builder: ServerBuilder<T>, port: u16) -> Result<Server<T>, BindError> {
        let addr = SocketAddr::new(builder.bind_addr, port);
        let mut listener =
            TcpListener::bind(addr).map_err(|source| BindError::Bind { addr, source })?;
        let local_addr = listener.local_addr().unwrap_or(addr);

        let mut poll = Poll::new().map_err(|source| BindError::Bind { addr, source })?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|source| BindError::Bind { addr, source })?;

        let registry = Arc::new(Mutex::new(Vec::new()));
        let incoming = Arc::new(BlockingQueue::new());
        let stop_flag = Arc::new(AtomicBool::new(false));

        let reactor_registry = registry.clone();
        let reactor_incoming = incoming.clone();
        let reactor_stop = stop_flag.clone();
        let on_client_connect = builder.on_client_connect.clone();
        let on_client_validated = builder.on_client_validated.clone();
        let max_body_size = builder.max_body_size;
        let core = builder.core;
        let priority = builder.priority;

        let reactor = thread::Builder::new()
            .name("tether-server".into())
            .spawn(move || {
                thread_boot(core, priority);
                reactor_loop(
                    poll,
                    listener,
                    reactor_registry,
                    reactor_incoming,
                    reactor_stop,
                    on_client_connect,
                    on_client_validated,
                    max_body_size,
                );
            })
            .expect("spawn tether-server reactor thread");

        info!(%local_addr, "tether: server listening");

        Ok(Server {
            reactor: Some(reactor),
            stop_flag,
            registry,
            incoming,
            on_message: builder.on_message,
            on_client_disconnect: builder.on_client_disconnect,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.join();
        }
    }

    /// Snapshot of currently-connected client handles.
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle<T>>> {
        self.registry.lock().unwrap().iter().filter(|h| h.is_connected()).cloned().collect()
    }

    /// Raw registry size, including connections that have died but
    /// haven't yet been culled by a `message_client` / `message_all_clients`
    /// sweep. Cleanup is opportunistic, not a background reaper — see
    /// [`Server::message_all_clients`].
    pub fn registry_len(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Enqueues `msg` for one specific client. If `target` has gone dead,
    /// fires `on_client_disconnect` and culls it from the registry instead.
    pub fn message_client(&self, target: &Arc<ConnectionHandle<T>>, msg: Message<T>) {
        if target.is_connected() {
            target.send(msg);
        } else {
            self.registry.lock().unwrap().retain(|h| !Arc::ptr_eq(h, target));
            (self.on_client_disconnect)(target);
        }
    }

    /// Enqueues `msg` for every connected client except `ignore` (pass
    /// `None` to broadcast to all). Dead connections found along the way
    /// fire `on_client_disconnect` and are culled from the registry,
    /// mirroring the original source's `MessageAllClients` sweep — this
    /// is also where registry cleanup happens; nothing prunes it between
    /// calls.
    pub fn message_all_clients(&self, msg: &Message<T>, ignore: Option<&Arc<ConnectionHandle<T>>>) {
        let targets = self.registry.lock().unwrap().clone();
        for target in &targets {
            if let Some(skip) = ignore {
                if Arc::ptr_eq(skip, target) {
                    continue;
                }
            }
            if target.is_connected() {
                target.send((*msg).clone());
            } else {
                (self.on_client_disconnect)(target);
            }
        }
        self.registry.lock().unwrap().retain(|h| h.is_connected());
    }

    /// Drains up to `max` inbound messages, invoking `on_message` for
    /// each. If `wait` is set and the inbound queue is currently empty,
    /// blocks until at least one message arrives before draining;
    /// otherwise returns immediately with whatever is already queued.
    pub fn update(&self, max: usize, wait: bool) -> usize {
        if wait {
            self.incoming.wait();
        }
        let hook = &self.on_message;
        self.incoming.drain_front(max, |owned| {
            if let Some(source) = owned.source {
                hook(&source, owned.message);
            }
        })
    }

    pub fn incoming(&self) -> &BlockingQueue<OwnedMessage<T>> {
        &self.incoming
    }
}

impl<T: MessageKind> Drop for Server<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn reactor_loop<T: MessageKind>(
    mut poll: Poll,
    mut listener: TcpListener,
    registry: Arc<Mutex<Vec<Arc<ConnectionHandle<T>>>>>,
    incoming: Arc<BlockingQueue<OwnedMessage<T>>>,
    stop_flag: Arc<AtomicBool>,
    on_client_connect: Arc<ConnectHook<T>>,
    on_client_validated: Arc<ValidatedHook<T>>,
    max_body_size: usize,
) {
    let mut events = Events::with_capacity(128);
    let mut conns: Vec<ConnectionIo<T>> = Vec::new();
    let next_id = AtomicU32::new(FIRST_CONNECTION_ID);

    loop {
        if stop_flag.load(Ordering::Acquire) {
            for conn in &mut conns {
                conn.close(poll.registry());
            }
            let _ = poll.registry().deregister(&mut listener);
            return;
        }

        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(?err, "tether: server poll error");
                continue;
            }
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_pending(&mut listener, &mut poll, &mut conns, &registry, &on_client_connect, &next_id, max_body_size);
                continue;
            }
            match conns.iter_mut().find(|c| c.token() == event.token()) {
                Some(conn) => {
                    let was_validated = conn.is_validated();
                    conn.on_event(event, poll.registry(), &incoming);
                    if !was_validated && conn.is_validated() {
                        on_client_validated(&conn.handle);
                    }
                }
                None => {
                    // A token can briefly outlive its connection: `conns.retain`
                    // runs once per loop iteration, so a token closed earlier
                    // this same batch can still show up in `events`.
                    tether_utils::safe_assert!(
                        event.token() != LISTENER_TOKEN,
                        "listener token routed through the per-connection dispatch arm"
                    );
                }
            }
        }

        for conn in &mut conns {
            conn.tick(poll.registry());
        }

        // Frees the reactor's own socket/state-machine resources for dead
        // connections promptly. This does NOT touch `registry` — that
        // list is culled only by `message_client` / `message_all_clients`
        // (see their docs), so the application observes a dead handle
        // until it next sweeps, by design.
        conns.retain(|c| c.handle.is_connected());
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_pending<T: MessageKind>(
    listener: &mut TcpListener,
    poll: &mut Poll,
    conns: &mut Vec<ConnectionIo<T>>,
    registry: &Arc<Mutex<Vec<Arc<ConnectionHandle<T>>>>>,
    on_client_connect: &Arc<ConnectHook<T>>,
    next_id: &AtomicU32,
    max_body_size: usize,
) {
    loop {
        let (mut stream, peer_addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!(?err, "tether: accept error");
                return;
            }
        };

        // id is 0 at veto time, matching the original source's
        // OnClientConnect(newconn) call happening before ConnectToClient
        // assigns a real id.
        let provisional = ConnectionHandle::new(0, peer_addr);
        if !on_client_connect(&provisional) {
            debug!(%peer_addr, "tether: connection rejected by admission hook");
            let _ = stream.shutdown(std::net::Shutdown::Both);
            continue;
        }

        let id = next_id.fetch_add(1, Ordering::AcqRel);
        let token = Token(id as usize);
        if let Err(err) = poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE) {
            warn!(?err, "tether: couldn't register accepted stream");
            continue;
        }

        let handle = ConnectionHandle::new(id, peer_addr);
        let (out, check) = new_server_nonce();
        let conn = ConnectionIo::new_server(stream, token, handle.clone(), max_body_size, out, check);

        registry.lock().unwrap().push(handle);
        conns.push(conn);
        info!(id, %peer_addr, "tether: client admitted");
    }
}
