//! The interface between the socket server and the protocols it carries.

use crate::session::SessionInfo;
use crate::SessionError;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Legacy length code: read until a line terminator
pub const PACKET_LEN_LINE_TERMINATOR: i32 = -1;
/// Legacy length code: read whatever remains in the stream
pub const PACKET_LEN_END_OF_STREAM: i32 = -2;
/// Legacy length flag: the masked value is the minimum packet length to read
/// before asking again
pub const PACKET_LEN_INCREMENTAL: i32 = 0x0100_0000;
pub const PACKET_LEN_INCREMENTAL_MASK: i32 = 0x00FF_FFFF;
/// Legacy length code: read up to the next line terminator, then ask again
pub const PACKET_LEN_INCREMENT_EOL: i32 = PACKET_LEN_INCREMENTAL | PACKET_LEN_INCREMENTAL_MASK;

/// What a [`PacketHandler`] wants the framer to do with a partially read packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketLength {
    /// The complete packet is exactly this many bytes long
    Exact(usize),
    /// The packet ends at the next line terminator
    LineTerminator,
    /// The packet is whatever is left in the stream (bounded by the maximum length)
    EndOfStream,
    /// Read this many more bytes, then ask again
    More(usize),
    /// Read until the packet is at least this long (and at least one byte longer
    /// than it is now), then ask again
    AtLeast(usize),
    /// Read up to and including the next line terminator, then ask again
    MoreToLineTerminator,
    /// Stop reading and end the session
    Terminate,
}

impl PacketLength {
    /// Decode a legacy integer length code.
    ///
    /// Values from the mask upwards are incremental whether or not the flag bit is
    /// set; a masked value equal to the mask itself means "up to the next line
    /// terminator".
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            PACKET_LEN_LINE_TERMINATOR => PacketLength::LineTerminator,
            n if n < 0 => PacketLength::EndOfStream,
            n if n < PACKET_LEN_INCREMENTAL_MASK => PacketLength::Exact(n as usize),
            n => match n & PACKET_LEN_INCREMENTAL_MASK {
                PACKET_LEN_INCREMENTAL_MASK => PacketLength::MoreToLineTerminator,
                min => PacketLength::AtLeast(min as usize),
            },
        }
    }
}

/// Protocol callbacks for one session.
///
/// A new handler is obtained from the listener's factory for every session, and is
/// driven only from that session's thread. Everything except [`handle_packet`] has a
/// default, so simple protocols need implement only that.
///
/// Handlers request side effects (suppressing a response, ending the session,
/// naming the session for [`Listener::write_to_session_id`]) through the
/// [`SessionInfo`] passed to [`session_started`].
///
/// [`handle_packet`]: PacketHandler::handle_packet
/// [`session_started`]: PacketHandler::session_started
/// [`Listener::write_to_session_id`]: crate::Listener::write_to_session_id
pub trait PacketHandler: Send {
    /// Called once when the session begins. `is_duplex` is true when responses can
    /// be written back on the same stream.
    fn session_started(
        &mut self,
        _session: &SessionInfo,
        _remote: Option<SocketAddr>,
        _is_duplex: bool,
        _is_text: bool,
    ) {
    }

    /// Bytes to send before anything is read (TCP only)
    fn initial_packet(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Inspect a partial binary packet. Only called once the minimum packet length
    /// has been read.
    fn packet_length(&mut self, packet: &[u8]) -> PacketLength {
        PacketLength::Exact(packet.len())
    }

    /// Process a complete packet, returning any response to send.
    fn handle_packet(&mut self, packet: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Bytes to send just before the session closes
    fn final_packet(&mut self, _had_error: bool) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn session_terminated(&mut self, _error: Option<&SessionError>, _bytes_read: u64, _bytes_written: u64) {}

    /// Called each time a read wait expires without data arriving.
    fn idle_timeout_interrupt(&mut self) {}

    fn minimum_packet_length(&self) -> Option<usize> {
        None
    }

    fn maximum_packet_length(&self) -> Option<usize> {
        None
    }

    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    fn packet_timeout(&self) -> Option<Duration> {
        None
    }

    fn session_timeout(&self) -> Option<Duration> {
        None
    }

    fn line_terminators(&self) -> Option<&[u8]> {
        None
    }

    fn ignore_chars(&self) -> Option<&[u8]> {
        None
    }

    /// Port to which UDP responses are sent, instead of the datagram's source port
    fn response_port(&self) -> Option<u16> {
        None
    }

    fn prompt_enabled(&self) -> bool {
        true
    }
}

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn PacketHandler> + Send + Sync>;

/// The handler factories for a listener: one for regular sessions and, optionally,
/// one for control channel sessions.
#[derive(Clone)]
pub struct Handlers {
    pub(crate) regular: HandlerFactory,
    pub(crate) control: Option<HandlerFactory>,
}

impl Handlers {
    pub fn new<H, F>(factory: F) -> Self
    where
        H: PacketHandler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self {
            regular: Arc::new(move || Box::new(factory()) as Box<dyn PacketHandler>),
            control: None,
        }
    }

    /// Route connections starting with the listener's `control_channel_header` to
    /// handlers from `factory`.
    pub fn with_control_channel<H, F>(mut self, factory: F) -> Self
    where
        H: PacketHandler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.control = Some(Arc::new(move || Box::new(factory()) as Box<dyn PacketHandler>));
        self
    }

    pub(crate) fn create(&self, control: bool) -> Box<dyn PacketHandler> {
        match (&self.control, control) {
            (Some(factory), true) => factory(),
            _ => (self.regular)(),
        }
    }
}

/// Passive observer of every packet read by a listener's sessions.
pub trait PacketObserver: Send + Sync {
    fn packet_received(&self, session: &SessionInfo, packet: &[u8]) -> anyhow::Result<()>;
}

/// How an injected byte stream should present itself to packet handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Behave like a TCP session: duplex, reads until the stream ends
    MimicTcp,
    /// Behave like a UDP datagram: not duplex
    MimicUdp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_legacy_lengths() {
        assert_eq!(PacketLength::from_raw(42), PacketLength::Exact(42));
        assert_eq!(PacketLength::from_raw(-1), PacketLength::LineTerminator);
        assert_eq!(PacketLength::from_raw(-2), PacketLength::EndOfStream);
        assert_eq!(PacketLength::from_raw(-7), PacketLength::EndOfStream);
        assert_eq!(PacketLength::from_raw(PACKET_LEN_INCREMENTAL | 6), PacketLength::AtLeast(6));
        assert_eq!(PacketLength::from_raw(0x0200_0009), PacketLength::AtLeast(9));
        assert_eq!(PacketLength::from_raw(PACKET_LEN_INCREMENT_EOL), PacketLength::MoreToLineTerminator);
        assert_eq!(PacketLength::from_raw(PACKET_LEN_INCREMENTAL_MASK), PacketLength::MoreToLineTerminator);
        assert_eq!(PacketLength::from_raw(PACKET_LEN_INCREMENTAL_MASK - 1), PacketLength::Exact(0x00FF_FFFE));
    }
}
