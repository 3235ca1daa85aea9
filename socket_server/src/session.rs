//! Session handlers: the pooled threads which each service one connection at a time.

use crate::client_socket::{ClientSocket, ReadOutcome, SessionWriter, SocketKind};
use crate::framer::{read_line, read_packet, FrameSource, FramingRules};
use crate::listener::ListenerShared;
use crate::protocols::PacketHandler;
use crate::{HandlerId, SessionError};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};

use std::{
    any::Any,
    fmt,
    io,
    net::{Shutdown, SocketAddr, TcpStream},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Longest a blocked read goes without checking for shutdown
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(250);

struct SessionShared
{
    handler_id: HandlerId,
    listener: String,
    kind: SocketKind,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    control: bool,
    duplex: bool,
    text: bool,
    start_time: DateTime<Utc>,
    started: Instant,
    last_read: Mutex<Option<DateTime<Utc>>>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    packets_read: AtomicU64,
    session_id: RwLock<Option<String>>,
    terminate: AtomicBool,
    send_response: AtomicBool,
    writer: Mutex<SessionWriter>,
    closer: Option<TcpStream>,
}

/// A handle on one running session.
///
/// Cloning is cheap; every clone refers to the same session. Packet handlers use
/// this to name the session, suppress responses or end the session, and monitoring
/// code uses it to read the session's counters while it runs.
#[derive(Clone)]
pub struct SessionInfo(Arc<SessionShared>);

impl SessionInfo
{
    pub(crate) fn new(handler_id: HandlerId, listener: &str, socket: &mut ClientSocket, text: bool) -> Self
    {
        Self(Arc::new(SessionShared {
            handler_id,
            listener: listener.to_string(),
            kind: socket.kind(),
            remote: socket.remote_addr(),
            local: socket.local_addr(),
            control: socket.is_control(),
            duplex: socket.is_duplex(),
            text,
            start_time: Utc::now(),
            started: Instant::now(),
            last_read: Mutex::new(None),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            packets_read: AtomicU64::new(0),
            session_id: RwLock::new(None),
            terminate: AtomicBool::new(false),
            send_response: AtomicBool::new(true),
            writer: Mutex::new(socket.take_writer()),
            closer: socket.closer(),
        }))
    }

    pub fn handler_id(&self) -> HandlerId
    {
        self.0.handler_id
    }

    pub fn listener_name(&self) -> &str
    {
        &self.0.listener
    }

    pub fn kind(&self) -> SocketKind
    {
        self.0.kind
    }

    pub fn remote_addr(&self) -> Option<SocketAddr>
    {
        self.0.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr>
    {
        self.0.local
    }

    pub fn is_control(&self) -> bool
    {
        self.0.control
    }

    pub fn is_duplex(&self) -> bool
    {
        self.0.duplex
    }

    pub fn is_text(&self) -> bool
    {
        self.0.text
    }

    pub fn start_time(&self) -> DateTime<Utc>
    {
        self.0.start_time
    }

    pub fn elapsed(&self) -> Duration
    {
        self.0.started.elapsed()
    }

    /// Time the most recent packet was read
    pub fn last_read_time(&self) -> Option<DateTime<Utc>>
    {
        *self.0.last_read.lock()
    }

    pub fn bytes_read(&self) -> u64
    {
        self.0.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64
    {
        self.0.bytes_written.load(Ordering::Relaxed)
    }

    pub fn packets_read(&self) -> u64
    {
        self.0.packets_read.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> Option<String>
    {
        self.0.session_id.read().clone()
    }

    /// Name this session, so that other threads can push data to it with
    /// [`Listener::write_to_session_id`](crate::Listener::write_to_session_id).
    pub fn set_session_id(&self, id: Option<String>)
    {
        *self.0.session_id.write() = id;
    }

    pub fn has_session_id(&self, id: &str) -> bool
    {
        self.0.session_id.read().as_deref() == Some(id)
    }

    /// Ask for the session to end once the current packet has been dealt with.
    pub fn terminate_session(&self)
    {
        self.0.terminate.store(true, Ordering::Relaxed);
    }

    pub fn terminate_requested(&self) -> bool
    {
        self.0.terminate.load(Ordering::Relaxed)
    }

    /// Whether responses (including the final packet) are written. Defaults to true.
    pub fn set_send_response(&self, send: bool)
    {
        self.0.send_response.store(send, Ordering::Relaxed);
    }

    pub fn send_response(&self) -> bool
    {
        self.0.send_response.load(Ordering::Relaxed)
    }

    /// Write a packet to the peer. Writes from different threads never interleave.
    pub fn write(&self, bytes: &[u8]) -> io::Result<usize>
    {
        let written = self.0.writer.lock().write_packet(bytes)?;
        self.0.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    pub fn summary(&self) -> SessionSummary
    {
        SessionSummary {
            handler: self.handler_id().to_string(),
            listener: self.0.listener.clone(),
            transport: self.kind(),
            remote: self.remote_addr(),
            session_id: self.session_id(),
            start_time: self.start_time(),
            last_read: self.last_read_time(),
            elapsed_ms: self.elapsed().as_millis() as u64,
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
            packets_read: self.packets_read(),
        }
    }

    pub(crate) fn same_session(&self, other: &SessionInfo) -> bool
    {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Shut down the underlying TCP socket, waking a blocked read.
    pub(crate) fn force_close(&self)
    {
        if let Some(socket) = &self.0.closer
        {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn add_bytes_read(&self, count: u64)
    {
        self.0.bytes_read.fetch_add(count, Ordering::Relaxed);
    }

    fn record_packet(&self)
    {
        *self.0.last_read.lock() = Some(Utc::now());
        self.0.packets_read.fetch_add(1, Ordering::Relaxed);
    }

    fn flush(&self) -> io::Result<()>
    {
        self.0.writer.lock().flush()
    }

    fn set_response_port(&self, port: u16)
    {
        self.0.writer.lock().set_response_port(port);
    }
}

impl fmt::Debug for SessionInfo
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("SessionInfo")
            .field("handler", &self.0.handler_id)
            .field("kind", &self.0.kind)
            .field("remote", &self.0.remote)
            .field("session_id", &self.session_id())
            .finish()
    }
}

/// A point-in-time description of a session, for monitoring.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionSummary
{
    pub handler: String,
    pub listener: String,
    pub transport: SocketKind,
    pub remote: Option<SocketAddr>,
    pub session_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last_read: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub packets_read: u64,
}

impl fmt::Display for SessionSummary
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} [{:?}", self.handler, self.transport)?;
        if let Some(remote) = self.remote
        {
            write!(f, " {}", remote)?;
        }
        write!(f, "] id={} started={} read={}/{} written={}",
               self.session_id.as_deref().unwrap_or("-"),
               self.start_time.format("%Y-%m-%d %H:%M:%S"),
               self.packets_read,
               self.bytes_read,
               self.bytes_written)
    }
}

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEnd
{
    /// The peer finished (closed the stream, or the datagram was consumed)
    Normal,
    /// The packet handler asked for the session to end
    Terminated,
    Error,
    /// The listener is shutting down
    Shutdown,
}

impl fmt::Display for SessionEnd
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let s = match self {
            Self::Normal => "normal",
            Self::Terminated => "terminated",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// The outcome of one session.
#[derive(Debug)]
pub struct SessionReport
{
    pub end: SessionEnd,
    pub error: Option<SessionError>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub packets_read: u64,
    pub elapsed: Duration,
}

struct SlotState
{
    assigned: Option<ClientSocket>,
    busy: bool,
}

/// One pooled handler thread's mailbox.
///
/// A slot is busy from the moment a connection is assigned until its session has
/// fully closed; only an idle slot accepts a new connection.
pub(crate) struct HandlerSlot
{
    pub id: HandlerId,
    state: Mutex<SlotState>,
    wake: Condvar,
    shutdown: AtomicBool,
}

impl HandlerSlot
{
    pub fn new(id: HandlerId) -> Self
    {
        Self {
            id,
            state: Mutex::new(SlotState { assigned: None, busy: false }),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Hand a connection to this handler if it is idle; otherwise give it back.
    pub fn try_assign(&self, socket: ClientSocket) -> Result<(), ClientSocket>
    {
        let mut state = self.state.lock();
        if state.busy || self.is_shutdown()
        {
            return Err(socket);
        }
        state.assigned = Some(socket);
        state.busy = true;
        self.wake.notify_one();
        Ok(())
    }

    /// Take back a connection the handler thread never picked up.
    pub fn reclaim(&self) -> Option<ClientSocket>
    {
        let mut state = self.state.lock();
        state.busy = false;
        state.assigned.take()
    }

    pub fn is_busy(&self) -> bool
    {
        self.state.lock().busy
    }

    pub fn signal_shutdown(&self)
    {
        self.shutdown.store(true, Ordering::Relaxed);
        let _state = self.state.lock();
        self.wake.notify_all();
    }

    pub fn is_shutdown(&self) -> bool
    {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn wait_for_connection(&self) -> Option<ClientSocket>
    {
        let mut state = self.state.lock();
        loop
        {
            if self.is_shutdown()
            {
                state.busy = true;
                return None;
            }
            if let Some(socket) = state.assigned.take()
            {
                return Some(socket);
            }
            self.wake.wait(&mut state);
        }
    }

    fn finished(&self)
    {
        self.state.lock().busy = false;
    }
}

/// Body of a pooled handler thread.
pub(crate) fn run_handler(listener: Arc<ListenerShared>, slot: Arc<HandlerSlot>)
{
    tracing::debug!("{} started", slot.id);

    while let Some(socket) = slot.wait_for_connection()
    {
        // A panicking handler factory must not take the pooled thread with it
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handle_session(&listener, slot.id, socket, &slot.shutdown)
        }));
        if let Err(payload) = outcome
        {
            tracing::error!("{}: session aborted: {}", slot.id, panic_message(payload));
        }
        slot.finished();
    }

    tracing::debug!("{} stopped", slot.id);
    listener.remove_handler(slot.id);
}

/// Adapts a [`ClientSocket`] to the framer: per-byte deadlines, wait slicing,
/// byte counting and shutdown checks.
struct SessionReader<'a>
{
    socket: &'a mut ClientSocket,
    info: &'a SessionInfo,
    listener: &'a ListenerShared,
    shutdown: &'a AtomicBool,
    session_deadline: Option<Instant>,
}

impl FrameSource for SessionReader<'_>
{
    fn read_byte(
        &mut self,
        deadline: Option<Instant>,
        index: usize,
        handler: &mut dyn PacketHandler,
    ) -> Result<u8, SessionError>
    {
        let interval = self.listener.settings.min_timeout_interval();
        let mut next_interrupt = interval.map(|i| Instant::now() + i);

        loop
        {
            let now = Instant::now();
            if matches!(self.session_deadline, Some(d) if now >= d)
            {
                return Err(SessionError::SessionTimeout);
            }
            if matches!(deadline, Some(d) if now >= d)
            {
                return Err(SessionError::ReadTimeout { index });
            }

            let wait = [deadline, self.session_deadline, next_interrupt]
                .into_iter()
                .flatten()
                .map(|d| d.saturating_duration_since(now))
                .fold(SHUTDOWN_CHECK_INTERVAL, Duration::min);

            match self.socket.read_byte(Some(wait))? {
                ReadOutcome::Byte(b) => {
                    self.info.add_bytes_read(1);
                    return Ok(b);
                }
                ReadOutcome::Eof => {
                    if self.info.terminate_requested()
                    {
                        return Err(SessionError::TerminateInterrupt { index });
                    }
                    return Err(SessionError::EndOfStream { index });
                }
                ReadOutcome::TimedOut => {
                    if self.shutdown.load(Ordering::Relaxed)
                    {
                        return Err(SessionError::Shutdown);
                    }
                    if let (Some(at), Some(interval)) = (next_interrupt, interval)
                    {
                        let now = Instant::now();
                        if now >= at && !matches!(deadline, Some(d) if now >= d)
                        {
                            handler.idle_timeout_interrupt();
                            if self.info.terminate_requested()
                            {
                                return Err(SessionError::TerminateInterrupt { index });
                            }
                            next_interrupt = Some(now + interval);
                        }
                    }
                }
            }
        }
    }

    fn available(&mut self) -> usize
    {
        self.socket.available()
    }

    fn fails_on_eos(&self) -> bool
    {
        self.socket.fails_on_eos()
    }

    fn terminate_requested(&self) -> bool
    {
        self.info.terminate_requested()
    }

    fn request_terminate(&mut self)
    {
        self.info.terminate_session();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String
{
    if let Some(s) = payload.downcast_ref::<&str>()
    {
        s.to_string()
    }
    else if let Some(s) = payload.downcast_ref::<String>()
    {
        s.clone()
    }
    else
    {
        "panic in packet handler".to_string()
    }
}

/// Run a protocol callback, turning a panic into a handler error which ends
/// only the current session.
fn contained<T>(f: impl FnOnce() -> T) -> Result<T, SessionError>
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| SessionError::Handler(panic_message(payload)))
}

/// Run one session to completion on the current thread.
pub(crate) fn handle_session(
    listener: &ListenerShared,
    handler_id: HandlerId,
    mut socket: ClientSocket,
    shutdown: &AtomicBool,
) -> SessionReport
{
    let config = &listener.config;
    let settings = &listener.settings;
    let control = socket.is_control();
    let text = config.is_text() && !control;
    let mut handler = listener.handlers.create(control);

    let info = SessionInfo::new(handler_id, &listener.name, &mut socket, text);
    let span = tracing::info_span!("session", handler = %handler_id, transport = ?info.kind());
    let _enter = span.enter();

    listener.register_session(info.clone());
    let log_enabled = settings.log_enabled();
    if log_enabled
    {
        match info.remote_addr() {
            Some(remote) => tracing::info!("Session start from {}{}", remote, if control { " [control]" } else { "" }),
            None => tracing::info!("Session start"),
        }
    }

    let result = contained(|| {
        handler.session_started(&info, info.remote_addr(), info.is_duplex(), text);
        if let Some(port) = handler.response_port()
        {
            info.set_response_port(port);
        }

        let session_deadline = handler
            .session_timeout()
            .or_else(|| settings.session_timeout())
            .map(|t| Instant::now() + t);

        session_loop(listener, &mut socket, &info, handler.as_mut(), shutdown, session_deadline, text)
    })
    .and_then(|r| r);

    if let Err(e @ SessionError::ReadTimeout { index: 0 }) = &result
    {
        if log_enabled
        {
            tracing::info!("{}", e);
        }
    }

    let (end, error) = match result {
        _ if shutdown.load(Ordering::Relaxed) => (SessionEnd::Shutdown, None),
        Ok(()) if info.terminate_requested() => (SessionEnd::Terminated, None),
        Ok(()) => (SessionEnd::Normal, None),
        Err(SessionError::Shutdown) => (SessionEnd::Shutdown, None),
        Err(SessionError::TerminateInterrupt { .. }) => (SessionEnd::Terminated, None),
        // Nothing of a new packet had arrived
        Err(SessionError::EndOfStream { index: 0 } | SessionError::ReadTimeout { index: 0 }) => (SessionEnd::Normal, None),
        Err(e) => (SessionEnd::Error, Some(e)),
    };

    let elapsed = info.elapsed();
    match &error {
        Some(e) => tracing::warn!("Session {} after {:?}: {}", end, elapsed, e),
        None if log_enabled => tracing::info!(
            "Session {} after {:?} (read {} bytes, wrote {} bytes)",
            end, elapsed, info.bytes_read(), info.bytes_written()
        ),
        None => (),
    }

    if info.send_response()
    {
        match contained(|| handler.final_packet(error.is_some())) {
            Ok(Ok(Some(packet))) if !packet.is_empty() => {
                if let Err(e) = info.write(&packet)
                {
                    tracing::warn!("Unable to write final packet: {}", e);
                }
            }
            Ok(Ok(_)) => (),
            Ok(Err(e)) => tracing::warn!("Final packet error: {:#}", e),
            Err(e) => tracing::warn!("Final packet error: {}", e),
        }
    }

    let (bytes_read, bytes_written) = (info.bytes_read(), info.bytes_written());
    if let Err(e) = contained(|| handler.session_terminated(error.as_ref(), bytes_read, bytes_written))
    {
        tracing::warn!("Session terminated callback failed: {}", e);
    }
    listener.unregister_session(&info);

    if let Err(e) = info.flush()
    {
        tracing::debug!("Flush failed: {}", e);
    }
    if let Err(e) = socket.set_linger(Duration::from_secs(config.linger_secs.into()))
    {
        tracing::debug!("Unable to set linger: {}", e);
    }
    socket.close();

    SessionReport {
        end,
        error,
        bytes_read: info.bytes_read(),
        bytes_written: info.bytes_written(),
        packets_read: info.packets_read(),
        elapsed,
    }
}

fn write_response(info: &SessionInfo, packet: &[u8]) -> Result<(), SessionError>
{
    if !packet.is_empty() && info.send_response()
    {
        info.write(packet)?;
    }
    Ok(())
}

fn session_loop(
    listener: &ListenerShared,
    socket: &mut ClientSocket,
    info: &SessionInfo,
    handler: &mut dyn PacketHandler,
    shutdown: &AtomicBool,
    session_deadline: Option<Instant>,
    text: bool,
) -> Result<(), SessionError>
{
    let config = &listener.config;
    let settings = &listener.settings;
    let connected = socket.fails_on_eos();

    if connected
    {
        if let Some(packet) = handler.initial_packet().map_err(SessionError::from_handler)?
        {
            write_response(info, &packet)?;
        }
    }

    loop
    {
        if matches!(session_deadline, Some(d) if Instant::now() >= d)
        {
            return Err(SessionError::SessionTimeout);
        }
        if shutdown.load(Ordering::Relaxed)
        {
            return Err(SessionError::Shutdown);
        }

        if connected && settings.prompt_enabled() && handler.prompt_enabled()
        {
            if let Some(prompt) = config.prompt_for(info.packets_read() as usize)
            {
                info.write(&prompt)?;
            }
        }

        let rules = FramingRules::resolve(config, settings, &*handler, info.is_control());
        let packet = {
            let mut reader = SessionReader {
                socket: &mut *socket,
                info,
                listener,
                shutdown,
                session_deadline,
            };
            if text
            {
                read_line(&mut reader, &rules, handler)?
            }
            else
            {
                read_packet(&mut reader, &rules, handler)?
            }
        };

        if info.terminate_requested()
        {
            return Ok(());
        }

        let packet = match packet {
            Some(packet) => packet,
            // Nothing more to read from a datagram or byte stream; a connected
            // stream just tolerated a timeout
            None if connected => continue,
            None => return Ok(()),
        };

        info.record_packet();

        for observer in listener.observers.read().iter()
        {
            observer
                .packet_received(info, &packet)
                .map_err(|e| SessionError::Observer(format!("{:#}", e)))?;
        }

        info.set_send_response(true);
        let response = handler.handle_packet(&packet).map_err(SessionError::from_handler)?;

        if let Some(response) = response
        {
            write_response(info, &response)?;
        }

        if info.terminate_requested()
        {
            return Ok(());
        }

        // A datagram or byte stream with nothing buffered has ended
        if matches!(info.kind(), SocketKind::Udp | SocketKind::Stream) && socket.available() == 0
        {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::protocols::StreamMode;
    use pretty_assertions::assert_eq;

    fn stream_socket(data: &[u8]) -> ClientSocket
    {
        ClientSocket::stream(Box::new(std::io::Cursor::new(data.to_vec())), None, StreamMode::MimicTcp)
    }

    #[test]
    fn session_info_counters()
    {
        let mut socket = stream_socket(b"");
        let info = SessionInfo::new(HandlerId::new(7), "test", &mut socket, true);

        assert_eq!(info.handler_id().to_string(), "ClientSession_007");
        assert!(info.is_duplex());
        assert!(info.send_response());
        assert_eq!(info.session_id(), None);

        info.set_session_id(Some("unit-42".to_string()));
        assert!(info.has_session_id("unit-42"));
        assert!(!info.has_session_id("unit-43"));

        info.add_bytes_read(5);
        info.record_packet();
        assert_eq!(info.write(b"discarded").unwrap(), 0);

        let summary = info.summary();
        assert_eq!(summary.bytes_read, 5);
        assert_eq!(summary.packets_read, 1);
        assert_eq!(summary.session_id.as_deref(), Some("unit-42"));
        assert!(summary.last_read.is_some());
        assert!(summary.to_string().starts_with("ClientSession_007 [Stream]"));
    }

    #[test]
    fn slot_accepts_one_connection_at_a_time()
    {
        let slot = HandlerSlot::new(HandlerId::new(1));
        assert!(slot.try_assign(stream_socket(b"a")).is_ok());
        assert!(slot.is_busy());
        assert!(slot.try_assign(stream_socket(b"b")).is_err());

        assert!(slot.reclaim().is_some());
        assert!(!slot.is_busy());

        slot.signal_shutdown();
        assert!(slot.try_assign(stream_socket(b"c")).is_err());
        assert!(slot.wait_for_connection().is_none());
    }

    #[test]
    fn panic_payloads()
    {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(42)), "panic in packet handler");
    }
}
