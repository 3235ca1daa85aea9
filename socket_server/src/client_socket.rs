//! One interface over the different kinds of peer a session can be serving.

use crate::config::ListenerConfig;
use crate::error::ListenerError;
use crate::protocols::StreamMode;

use nix::sys::socket::{setsockopt, sockopt};
use parking_lot::Mutex;
use rustls::{ServerConnection, StreamOwned};

use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, UdpSocket},
    os::unix::io::AsRawFd,
    sync::Arc,
    time::{Duration, Instant},
};

pub(crate) type TlsStream = StreamOwned<ServerConnection, TcpStream>;

/// Longest a TLS read holds the stream lock, so pushed writes can interleave
const TLS_READ_SLICE: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 4096;

/// The transport a session's peer is connected over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind
{
    Tcp,
    Tls,
    Udp,
    Stream,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome
{
    Byte(u8),
    Eof,
    TimedOut,
}

enum Fill
{
    Data,
    Eof,
    TimedOut,
}

enum Connection
{
    Tcp(TcpStream),
    Tls(Arc<Mutex<TlsStream>>),
    Datagram,
    Stream(Box<dyn Read + Send>),
}

/// The read side of one peer, plus the means to close it.
///
/// Bytes are read from the transport in chunks into an internal buffer, which also
/// holds bytes looked at by [`peek`](Self::peek) but not yet consumed.
pub(crate) struct ClientSocket
{
    conn: Connection,
    kind: SocketKind,
    duplex: bool,
    buffer: VecDeque<u8>,
    eof: bool,
    control: bool,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    writer: Option<SessionWriter>,
}

impl ClientSocket
{
    pub fn tcp(stream: TcpStream) -> io::Result<Self>
    {
        let writer = SessionWriter::Tcp(stream.try_clone()?);
        Ok(Self {
            remote: stream.peer_addr().ok(),
            local: stream.local_addr().ok(),
            conn: Connection::Tcp(stream),
            kind: SocketKind::Tcp,
            duplex: true,
            buffer: VecDeque::new(),
            eof: false,
            control: false,
            writer: Some(writer),
        })
    }

    /// Wrap an accepted stream in a server-side TLS session. The handshake happens on
    /// the first read or write.
    pub fn tls(stream: TcpStream, config: Arc<rustls::ServerConfig>) -> Result<Self, ListenerError>
    {
        let remote = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let conn = ServerConnection::new(config)?;
        let tls = Arc::new(Mutex::new(StreamOwned::new(conn, stream)));

        Ok(Self {
            conn: Connection::Tls(Arc::clone(&tls)),
            kind: SocketKind::Tls,
            duplex: true,
            buffer: VecDeque::new(),
            eof: false,
            control: false,
            remote,
            local,
            writer: Some(SessionWriter::Tls(tls)),
        })
    }

    /// A single received datagram. Everything there is to read is already buffered.
    pub fn datagram(data: &[u8], remote: SocketAddr, local: Option<SocketAddr>, responder: UdpResponder) -> Self
    {
        Self {
            conn: Connection::Datagram,
            kind: SocketKind::Udp,
            duplex: false,
            buffer: data.iter().copied().collect(),
            eof: true,
            control: false,
            remote: Some(remote),
            local,
            writer: Some(SessionWriter::Udp(responder)),
        }
    }

    /// An injected byte stream. Responses go to `output` if given, and are otherwise
    /// logged and dropped.
    pub fn stream(input: Box<dyn Read + Send>, output: Option<Box<dyn Write + Send>>, mode: StreamMode) -> Self
    {
        Self {
            conn: Connection::Stream(input),
            kind: SocketKind::Stream,
            duplex: mode == StreamMode::MimicTcp,
            buffer: VecDeque::new(),
            eof: false,
            control: false,
            remote: None,
            local: None,
            writer: Some(match output {
                Some(w) => SessionWriter::Stream(w),
                None => SessionWriter::Discard,
            }),
        }
    }

    pub fn kind(&self) -> SocketKind
    {
        self.kind
    }

    pub fn is_duplex(&self) -> bool
    {
        self.duplex
    }

    /// End of stream mid-packet is an error only on connected streams.
    pub fn fails_on_eos(&self) -> bool
    {
        matches!(self.kind, SocketKind::Tcp | SocketKind::Tls)
    }

    pub fn is_control(&self) -> bool
    {
        self.control
    }

    pub fn set_control(&mut self, control: bool)
    {
        self.control = control;
    }

    pub fn remote_addr(&self) -> Option<SocketAddr>
    {
        self.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr>
    {
        self.local
    }

    /// Take the write half. Only the first call returns it.
    pub fn take_writer(&mut self) -> SessionWriter
    {
        self.writer.take().unwrap_or(SessionWriter::Discard)
    }

    /// A second handle on the underlying TCP socket, used to force the session closed
    /// from another thread.
    pub fn closer(&self) -> Option<TcpStream>
    {
        match &self.conn {
            Connection::Tcp(s) => s.try_clone().ok(),
            Connection::Tls(tls) => tls.lock().sock.try_clone().ok(),
            _ => None,
        }
    }

    /// Number of bytes which can be read without blocking.
    pub fn available(&self) -> usize
    {
        let pending = match &self.conn {
            Connection::Tcp(s) if !self.eof => bytes_pending(s),
            _ => 0,
        };
        self.buffer.len() + pending
    }

    /// Read one byte, waiting no longer than `wait` (indefinitely if `None`).
    pub fn read_byte(&mut self, wait: Option<Duration>) -> io::Result<ReadOutcome>
    {
        if self.buffer.is_empty()
        {
            match self.fill(wait)? {
                Fill::Data => (),
                Fill::Eof => return Ok(ReadOutcome::Eof),
                Fill::TimedOut => return Ok(ReadOutcome::TimedOut),
            }
        }

        Ok(self.buffer.pop_front().map(ReadOutcome::Byte).unwrap_or(ReadOutcome::Eof))
    }

    /// Look at up to `len` bytes without consuming them. Returns fewer if the stream
    /// ends, or `wait` passes, first.
    pub fn peek(&mut self, len: usize, wait: Duration) -> io::Result<Vec<u8>>
    {
        let deadline = Instant::now() + wait;

        while self.buffer.len() < len
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
            {
                break;
            }
            match self.fill(Some(remaining))? {
                Fill::Data => continue,
                Fill::Eof | Fill::TimedOut => break,
            }
        }

        Ok(self.buffer.iter().take(len).copied().collect())
    }

    /// True if the stream begins with `pattern`.
    pub fn peek_pattern(&mut self, pattern: &[u8], wait: Duration) -> io::Result<bool>
    {
        Ok(self.peek(pattern.len(), wait)? == pattern)
    }

    /// Discard up to `count` buffered bytes.
    pub fn skip(&mut self, count: usize)
    {
        let count = count.min(self.buffer.len());
        self.buffer.drain(..count);
    }

    pub fn set_linger(&self, linger: Duration) -> io::Result<()>
    {
        let fd = match &self.conn {
            Connection::Tcp(s) => s.as_raw_fd(),
            Connection::Tls(tls) => tls.lock().sock.as_raw_fd(),
            _ => return Ok(()),
        };

        let value = libc::linger {
            l_onoff: 1,
            l_linger: linger.as_secs().min(i32::MAX as u64) as libc::c_int,
        };
        setsockopt(fd, sockopt::Linger, &value)?;
        Ok(())
    }

    pub fn close(&mut self)
    {
        match &mut self.conn {
            Connection::Tcp(s) => {
                let _ = s.flush();
                let _ = s.shutdown(Shutdown::Both);
            }
            Connection::Tls(tls) => {
                let mut tls = tls.lock();
                tls.conn.send_close_notify();
                let _ = tls.flush();
                let _ = tls.sock.shutdown(Shutdown::Both);
            }
            Connection::Datagram | Connection::Stream(_) => (),
        }
        self.eof = true;
        self.buffer.clear();
    }

    fn fill(&mut self, wait: Option<Duration>) -> io::Result<Fill>
    {
        if self.eof
        {
            return Ok(Fill::Eof);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let result = match &mut self.conn {
            Connection::Tcp(s) => {
                s.set_read_timeout(wait.map(at_least_1ms))?;
                s.read(&mut chunk)
            }
            Connection::Tls(tls) => read_tls(tls, &mut chunk, wait),
            Connection::Datagram => Ok(0),
            Connection::Stream(input) => input.read(&mut chunk),
        };

        match result {
            Ok(0) => {
                self.eof = true;
                Ok(Fill::Eof)
            }
            Ok(n) => {
                self.buffer.extend(&chunk[..n]);
                Ok(Fill::Data)
            }
            Err(e) if is_timeout(&e) || e.kind() == ErrorKind::Interrupted => Ok(Fill::TimedOut),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.eof = true;
                Ok(Fill::Eof)
            }
            Err(e) => Err(e),
        }
    }
}

fn read_tls(tls: &Mutex<TlsStream>, chunk: &mut [u8], wait: Option<Duration>) -> io::Result<usize>
{
    let deadline = wait.map(|w| Instant::now() + w);

    loop
    {
        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero()
                {
                    return Err(ErrorKind::TimedOut.into());
                }
                remaining.min(TLS_READ_SLICE)
            }
            None => TLS_READ_SLICE,
        };

        let mut tls = tls.lock();
        tls.sock.set_read_timeout(Some(at_least_1ms(slice)))?;
        match tls.read(chunk) {
            Err(e) if is_timeout(&e) => continue,
            other => return other,
        }
    }
}

fn is_timeout(e: &io::Error) -> bool
{
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

// A zero read timeout means "block forever" to the OS
fn at_least_1ms(d: Duration) -> Duration
{
    d.max(Duration::from_millis(1))
}

fn bytes_pending(stream: &TcpStream) -> usize
{
    let mut pending: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(stream.as_raw_fd(), libc::FIONREAD, &mut pending) };
    if rc < 0 { 0 } else { pending.max(0) as usize }
}

/// The write half of a session.
pub(crate) enum SessionWriter
{
    Tcp(TcpStream),
    Tls(Arc<Mutex<TlsStream>>),
    Udp(UdpResponder),
    Stream(Box<dyn Write + Send>),
    Discard,
}

impl SessionWriter
{
    /// Write one complete packet, returning the number of bytes sent.
    pub fn write_packet(&mut self, bytes: &[u8]) -> io::Result<usize>
    {
        match self {
            Self::Tcp(s) => {
                s.write_all(bytes)?;
                s.flush()?;
            }
            Self::Tls(tls) => {
                let mut tls = tls.lock();
                tls.write_all(bytes)?;
                tls.flush()?;
            }
            Self::Udp(responder) => return responder.send(bytes),
            Self::Stream(w) => {
                w.write_all(bytes)?;
                w.flush()?;
            }
            Self::Discard => {
                tracing::debug!("Discarding response: 0x{}", hex::encode(bytes));
                return Ok(0);
            }
        }
        Ok(bytes.len())
    }

    pub fn flush(&mut self) -> io::Result<()>
    {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Tls(tls) => tls.lock().flush(),
            Self::Stream(w) => w.flush(),
            Self::Udp(_) | Self::Discard => Ok(()),
        }
    }

    /// Redirect UDP responses to `port` on the peer's address.
    pub fn set_response_port(&mut self, port: u16)
    {
        if let Self::Udp(responder) = self
        {
            responder.target.set_port(port);
        }
    }
}

enum ReplySource
{
    Listener(Arc<UdpSocket>),
    Bind(IpAddr),
}

/// Sends responses to the peer of a UDP session.
pub(crate) struct UdpResponder
{
    source: ReplySource,
    target: SocketAddr,
}

impl UdpResponder
{
    pub fn new(listener: &Arc<UdpSocket>, config: &ListenerConfig, mut peer: SocketAddr) -> Self
    {
        if let Some(port) = config.remote_port
        {
            peer.set_port(port);
        }

        let source = match config.udp_reply_bind_address {
            Some(addr) => ReplySource::Bind(addr),
            None if config.udp_reply_from_listen_port => ReplySource::Listener(Arc::clone(listener)),
            None => ReplySource::Bind(unspecified_for(&peer)),
        };

        Self { source, target: peer }
    }

    pub fn send(&self, bytes: &[u8]) -> io::Result<usize>
    {
        match &self.source {
            ReplySource::Listener(socket) => socket.send_to(bytes, self.target),
            ReplySource::Bind(addr) => send_datagram(Some(*addr), self.target, bytes),
        }
    }
}

fn unspecified_for(target: &SocketAddr) -> IpAddr
{
    match target {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    }
}

/// Send one datagram from a transient socket bound to `bind` (or the unspecified
/// address) on an ephemeral port.
pub fn send_datagram(bind: Option<IpAddr>, target: SocketAddr, bytes: &[u8]) -> io::Result<usize>
{
    let local = bind.unwrap_or_else(|| unspecified_for(&target));
    let socket = UdpSocket::bind(SocketAddr::new(local, 0))?;
    socket.send_to(bytes, target)
}
