use crate::client_socket::{ClientSocket, UdpResponder};
use crate::config::{ListenerConfig, RuntimeSettings, Transport};
use crate::protocols::{Handlers, PacketObserver, StreamMode};
use crate::registry::ListenerRegistry;
use crate::session::{handle_session, run_handler, HandlerSlot, SessionInfo, SessionReport, SessionSummary};
use crate::*;

use nix::sys::socket::{self as nix_socket, setsockopt, sockopt};
use parking_lot::{Mutex, RwLock};

use std::{
    collections::BTreeSet,
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket},
    os::unix::io::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// How long to wait for a control channel header at the start of a connection
const CONTROL_HEADER_WAIT: Duration = Duration::from_millis(500);
/// UDP receive wait, between checks for shutdown
const UDP_RECEIVE_WAIT: Duration = Duration::from_millis(500);
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);
const MIN_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const UDP_BUFFER_SIZE: usize = 65536;

enum BoundSocket
{
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

impl BoundSocket
{
    fn try_clone(&self) -> io::Result<Self>
    {
        Ok(match self {
            Self::Tcp(l) => Self::Tcp(l.try_clone()?),
            Self::Udp(s) => Self::Udp(Arc::clone(s)),
        })
    }

    /// Wake the listener thread out of accept/receive.
    fn close(&self)
    {
        if let Self::Tcp(l) = self
        {
            if let Err(e) = nix_socket::shutdown(l.as_raw_fd(), nix_socket::Shutdown::Both)
            {
                tracing::debug!("Listening socket shutdown: {}", e);
            }
        }
    }
}

/// State shared between a listener's handle, its listener thread and its
/// session handler threads.
pub(crate) struct ListenerShared
{
    pub id: ListenerId,
    pub name: String,
    pub config: ListenerConfig,
    pub settings: RuntimeSettings,
    pub handlers: Handlers,
    pub observers: RwLock<Vec<Arc<dyn PacketObserver>>>,
    tls: Option<Arc<rustls::ServerConfig>>,
    socket: Mutex<Option<BoundSocket>>,
    local_addr: Option<SocketAddr>,
    pool: Mutex<Vec<Arc<HandlerSlot>>>,
    sessions: Mutex<Vec<SessionInfo>>,
    handler_ids: HandlerIdGenerator,
    started: AtomicBool,
    stopping: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerShared
{
    pub fn register_session(&self, info: SessionInfo)
    {
        self.sessions.lock().push(info);
    }

    pub fn unregister_session(&self, info: &SessionInfo)
    {
        self.sessions.lock().retain(|s| !s.same_session(info));
    }

    pub fn remove_handler(&self, id: HandlerId)
    {
        self.pool.lock().retain(|slot| slot.id != id);
    }

    fn run(self: Arc<Self>, socket: BoundSocket, registry: ListenerRegistry)
    {
        tracing::info!("{} listening on {:?}", self.name, self.local_addr);

        match socket {
            BoundSocket::Tcp(listener) => self.accept_loop(listener),
            BoundSocket::Udp(socket) => self.receive_loop(socket),
        }

        tracing::info!("{} stopped", self.name);
        registry.remove(self.id);
    }

    fn accept_loop(self: &Arc<Self>, listener: TcpListener)
    {
        loop
        {
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(_) if self.is_stopping() => break,
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::ConnectionAborted | ErrorKind::WouldBlock) => continue,
                Err(e) => {
                    tracing::error!("{}: accept failed: {}", self.name, e);
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                    continue;
                }
            };

            if self.is_stopping()
            {
                break;
            }

            let socket = match &self.tls {
                Some(tls) => ClientSocket::tls(stream, Arc::clone(tls)),
                None => ClientSocket::tcp(stream).map_err(ListenerError::from),
            };

            match socket {
                Ok(socket) => self.dispatch(socket),
                Err(e) => tracing::warn!("{}: unable to set up connection: {}", self.name, e),
            }
        }
    }

    fn receive_loop(self: &Arc<Self>, socket: Arc<UdpSocket>)
    {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        let local = socket.local_addr().ok();

        while !self.is_stopping()
        {
            match socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    if self.is_stopping()
                    {
                        break;
                    }
                    let responder = UdpResponder::new(&socket, &self.config, peer);
                    self.dispatch(ClientSocket::datagram(&buf[..len], peer, local, responder));
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => continue,
                Err(_) if self.is_stopping() => break,
                Err(e) => {
                    tracing::error!("{}: receive failed: {}", self.name, e);
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }
    }

    /// Hand a new connection to an idle handler, growing the pool if allowed.
    /// Connections which can't be handled are closed immediately.
    fn dispatch(self: &Arc<Self>, mut socket: ClientSocket)
    {
        if let (Some(header), Some(_)) = (self.config.control_channel_header.as_deref(), &self.handlers.control)
        {
            match socket.peek_pattern(header, CONTROL_HEADER_WAIT) {
                Ok(true) => {
                    socket.skip(header.len());
                    socket.set_control(true);
                }
                Ok(false) => (),
                Err(e) => {
                    tracing::warn!("{}: error reading connection header: {}", self.name, e);
                    socket.close();
                    return;
                }
            }
        }

        let mut pool = self.pool.lock();

        // Shutdown may have signalled the pool before we took the lock
        if self.is_stopping()
        {
            drop(pool);
            socket.close();
            return;
        }

        for slot in pool.iter()
        {
            match slot.try_assign(socket) {
                Ok(()) => return,
                Err(s) => socket = s,
            }
        }

        let max = self.settings.max_sessions();
        if max > 0 && pool.len() >= max
        {
            tracing::warn!("{}: all {} session handlers busy, rejecting {:?}", self.name, pool.len(), socket.remote_addr());
            drop(pool);
            socket.close();
            return;
        }

        let slot = Arc::new(HandlerSlot::new(self.handler_ids.next()));
        if let Err(mut socket) = slot.try_assign(socket)
        {
            socket.close();
            return;
        }

        let spawned = thread::Builder::new().name(format!("{}/{}", self.name, slot.id)).spawn({
            let listener = Arc::clone(self);
            let slot = Arc::clone(&slot);
            move || run_handler(listener, slot)
        });

        match spawned {
            Ok(_) => pool.push(slot),
            Err(e) => {
                let cap = pool.len().max(1);
                tracing::error!("{}: unable to start session handler ({}); limiting pool to {}", self.name, e, cap);
                self.settings.set_max_sessions(cap);
                drop(pool);
                if let Some(mut socket) = slot.reclaim()
                {
                    socket.close();
                }
            }
        }
    }

    fn is_stopping(&self) -> bool
    {
        self.stopping.load(Ordering::Relaxed)
    }
}

/// A TCP, UDP or TLS listener and its pool of session handler threads.
///
/// `Listener` is a cheap handle; clones refer to the same listener.
#[derive(Clone)]
pub struct Listener
{
    shared: Arc<ListenerShared>,
}

impl Listener
{
    /// Bind the listening socket described by `config`. Nothing is accepted until
    /// [`start`](Self::start) is called.
    pub fn bind(config: ListenerConfig, handlers: Handlers) -> Result<Self, ListenerError>
    {
        let address = SocketAddr::new(config.bind_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), config.port);

        let tls = match (config.transport, &config.tls) {
            (Transport::Tls, Some(files)) => {
                let settings = files.load().map_err(|e| ListenerError::InvalidConfig(e.to_string()))?;
                Some(settings.server_config()?)
            }
            (Transport::Tls, None) => return Err(ListenerError::NoTlsConfig),
            _ => None,
        };

        let socket = match config.transport {
            Transport::Tcp | Transport::Tls => {
                let listener = TcpListener::bind(address)?;
                nix_socket::listen(listener.as_raw_fd(), config.backlog.max(1) as usize)?;
                BoundSocket::Tcp(listener)
            }
            Transport::Udp => {
                let socket = UdpSocket::bind(address)?;
                if config.udp_receive_buffer_size > 0
                {
                    setsockopt(socket.as_raw_fd(), sockopt::RcvBuf, &config.udp_receive_buffer_size)?;
                }
                socket.set_read_timeout(Some(UDP_RECEIVE_WAIT))?;
                BoundSocket::Udp(Arc::new(socket))
            }
        };

        let local_addr = match &socket {
            BoundSocket::Tcp(l) => l.local_addr()?,
            BoundSocket::Udp(s) => s.local_addr()?,
        };

        Ok(Self::build(config, handlers, tls, Some(socket), Some(local_addr)))
    }

    /// A listener with no socket, which can only run byte stream sessions via
    /// [`run_stream_session`](Self::run_stream_session).
    pub fn detached(config: ListenerConfig, handlers: Handlers) -> Self
    {
        Self::build(config, handlers, None, None, None)
    }

    fn build(
        config: ListenerConfig,
        handlers: Handlers,
        tls: Option<Arc<rustls::ServerConfig>>,
        socket: Option<BoundSocket>,
        local_addr: Option<SocketAddr>,
    ) -> Self
    {
        static LISTENER_IDS: ListenerIdGenerator = ListenerIdGenerator::new(1);

        let id = LISTENER_IDS.next();
        let name = config.name.clone().unwrap_or_else(|| id.to_string());

        Self {
            shared: Arc::new(ListenerShared {
                id,
                name,
                settings: RuntimeSettings::new(&config),
                config,
                handlers,
                observers: RwLock::new(Vec::new()),
                tls,
                socket: Mutex::new(socket),
                local_addr,
                pool: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
                handler_ids: HandlerIdGenerator::new(1),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Start accepting connections on a new thread, registering the listener with
    /// `registry` until it stops.
    pub fn start(&self, registry: &ListenerRegistry) -> Result<(), ListenerError>
    {
        let socket = match self.shared.socket.lock().as_ref() {
            Some(socket) => socket.try_clone()?,
            None => return Err(ListenerError::Detached),
        };

        if self.shared.started.swap(true, Ordering::SeqCst)
        {
            return Err(ListenerError::AlreadyStarted);
        }

        registry.add(self.clone());

        let spawned = thread::Builder::new().name(self.shared.name.clone()).spawn({
            let shared = Arc::clone(&self.shared);
            let registry = registry.clone();
            move || shared.run(socket, registry)
        });

        match spawned {
            Ok(handle) => {
                *self.shared.thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                registry.remove(self.shared.id);
                Err(e.into())
            }
        }
    }

    pub fn id(&self) -> ListenerId
    {
        self.shared.id
    }

    pub fn name(&self) -> &str
    {
        &self.shared.name
    }

    pub fn config(&self) -> &ListenerConfig
    {
        &self.shared.config
    }

    /// The settings which may be changed while the listener runs
    pub fn settings(&self) -> &RuntimeSettings
    {
        &self.shared.settings
    }

    pub fn local_addr(&self) -> Option<SocketAddr>
    {
        self.shared.local_addr
    }

    pub fn is_stopping(&self) -> bool
    {
        self.shared.is_stopping()
    }

    /// Number of session handler threads, busy or idle
    pub fn handler_count(&self) -> usize
    {
        self.shared.pool.lock().len()
    }

    pub fn busy_handler_count(&self) -> usize
    {
        self.shared.pool.lock().iter().filter(|slot| slot.is_busy()).count()
    }

    pub fn add_observer(&self, observer: Arc<dyn PacketObserver>)
    {
        self.shared.observers.write().push(observer);
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo>
    {
        self.shared.sessions.lock().clone()
    }

    pub fn active_session_count(&self) -> usize
    {
        self.shared.sessions.lock().len()
    }

    /// The distinct session IDs of the currently active sessions.
    pub fn active_session_ids(&self) -> Vec<String>
    {
        self.active_sessions()
            .iter()
            .filter_map(SessionInfo::session_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Summary of the first active session with the given ID
    pub fn active_session(&self, id: &str) -> Option<SessionSummary>
    {
        self.active_sessions().iter().find(|s| s.has_session_id(id)).map(SessionInfo::summary)
    }

    pub fn log_active_sessions(&self, header: &str)
    {
        let sessions = self.active_sessions();
        tracing::info!("{}: {} active session(s) on {}", header, sessions.len(), self.shared.name);
        for session in sessions
        {
            tracing::info!("  {}", session.summary());
        }
    }

    /// Write `bytes` to every active session with the given session ID, returning
    /// the number of sessions written to.
    pub fn write_to_session_id(&self, id: &str, bytes: &[u8]) -> usize
    {
        let mut count = 0;
        for session in self.active_sessions().iter().filter(|s| s.has_session_id(id))
        {
            match session.write(bytes) {
                Ok(_) => count += 1,
                Err(e) => tracing::warn!("Unable to write to session {} ({}): {}", id, session.handler_id(), e),
            }
        }
        count
    }

    /// Run a session over an injected byte stream on the calling thread.
    pub fn run_stream_session<R>(&self, input: R, output: Option<Box<dyn Write + Send>>, mode: StreamMode) -> SessionReport
        where R: Read + Send + 'static
    {
        let socket = ClientSocket::stream(Box::new(input), output, mode);
        let handler_id = self.shared.handler_ids.next();
        handle_session(&self.shared, handler_id, socket, &self.shared.stopping)
    }

    /// Stop accepting connections and wait up to `timeout` (at least one second) for
    /// the session handlers to finish. Sessions still running at the deadline have
    /// their sockets shut down.
    ///
    /// Returns true if every handler finished in time.
    pub fn shutdown(&self, timeout: Duration) -> bool
    {
        let shared = &self.shared;
        let timeout = timeout.max(MIN_SHUTDOWN_TIMEOUT);
        let deadline = Instant::now() + timeout;

        shared.stopping.store(true, Ordering::SeqCst);
        for slot in shared.pool.lock().iter()
        {
            slot.signal_shutdown();
        }

        while !shared.pool.lock().is_empty() && Instant::now() < deadline
        {
            thread::sleep(SHUTDOWN_POLL);
        }

        let drained = shared.pool.lock().is_empty();
        if !drained
        {
            tracing::warn!("{}: {} session handler(s) still running after {:?}", shared.name, shared.pool.lock().len(), timeout);
            for session in self.active_sessions()
            {
                session.force_close();
            }
        }

        if let Some(socket) = shared.socket.lock().take()
        {
            socket.close();
        }

        let handle = shared.thread.lock().take();
        if let Some(handle) = handle
        {
            if handle.thread().id() != thread::current().id() && handle.join().is_err()
            {
                tracing::error!("{}: listener thread panicked", shared.name);
            }
        }

        drained
    }
}

impl std::fmt::Debug for Listener
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Listener")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("local_addr", &self.shared.local_addr)
            .finish()
    }
}
