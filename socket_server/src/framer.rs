//! Packet framing: turning a byte stream into discrete packets.
//!
//! Text listeners read lines ([`read_line`]); binary listeners and control channel
//! sessions read packets whose boundaries are negotiated byte by byte with the
//! session's [`PacketHandler`] ([`read_packet`]).

use crate::config::{ListenerConfig, RuntimeSettings};
use crate::pattern::TerminatorMatcher;
use crate::protocols::{PacketHandler, PacketLength};
use crate::SessionError;

use std::time::{Duration, Instant};

/// Where the framer gets its bytes from.
pub(crate) trait FrameSource {
    /// Read one byte, failing with [`SessionError::ReadTimeout`] once `deadline` has
    /// passed. `index` is the number of bytes already read into the current packet.
    fn read_byte(
        &mut self,
        deadline: Option<Instant>,
        index: usize,
        handler: &mut dyn PacketHandler,
    ) -> Result<u8, SessionError>;

    /// Number of bytes which can be read without blocking
    fn available(&mut self) -> usize;

    /// True for connected streams, where the peer closing mid-packet is an error
    fn fails_on_eos(&self) -> bool;

    fn terminate_requested(&self) -> bool;

    fn request_terminate(&mut self);
}

/// The framing rules in force for one packet, after applying handler overrides.
#[derive(Debug, Clone)]
pub(crate) struct FramingRules {
    pub control: bool,
    pub min_len: usize,
    pub max_len: usize,
    pub line_terminators: Vec<u8>,
    pub ignore_chars: Vec<u8>,
    pub backspace_chars: Vec<u8>,
    pub include_terminator: bool,
    pub terminator: Option<Vec<u8>>,
    pub idle_timeout: Option<Duration>,
    pub packet_timeout: Option<Duration>,
    pub terminate_on_timeout: bool,
}

impl FramingRules {
    pub fn resolve(
        config: &ListenerConfig,
        settings: &RuntimeSettings,
        handler: &dyn PacketHandler,
        control: bool,
    ) -> Self {
        let max_len = handler
            .maximum_packet_length()
            .filter(|n| *n > 0)
            .unwrap_or_else(|| config.max_packet_length());
        let min_len = handler
            .minimum_packet_length()
            .filter(|n| *n > 0)
            .unwrap_or_else(|| config.min_packet_length());

        let backspace_chars = if config.is_text() && config.has_prompt() {
            config.backspace_chars.clone()
        } else {
            Vec::new()
        };

        Self {
            control,
            min_len,
            max_len,
            line_terminators: handler
                .line_terminators()
                .map(<[u8]>::to_vec)
                .unwrap_or_else(|| config.line_terminators.clone()),
            ignore_chars: handler
                .ignore_chars()
                .map(<[u8]>::to_vec)
                .unwrap_or_else(|| config.ignore_chars().to_vec()),
            backspace_chars,
            include_terminator: config.include_line_terminator,
            terminator: if control { None } else { config.packet_terminator().map(<[u8]>::to_vec) },
            idle_timeout: handler.idle_timeout().or_else(|| settings.idle_timeout()),
            packet_timeout: handler.packet_timeout().or_else(|| settings.packet_timeout()),
            terminate_on_timeout: settings.terminate_on_timeout(),
        }
    }

    fn is_line_terminator(&self, ch: u8) -> bool {
        self.line_terminators.contains(&ch)
    }

    fn is_ignored(&self, ch: u8) -> bool {
        self.ignore_chars.contains(&ch)
    }
}

/// Read one text line.
///
/// Ignore characters and non-printable bytes (other than tab) are dropped, and
/// backspace characters erase the previous byte. The terminator is excluded from
/// the line unless `include_terminator` is set.
///
/// Returns `Ok(None)` if the stream ended, or a timeout was tolerated, before any
/// byte of a new line arrived.
pub(crate) fn read_line<S>(
    src: &mut S,
    rules: &FramingRules,
    handler: &mut dyn PacketHandler,
) -> Result<Option<Vec<u8>>, SessionError>
where
    S: FrameSource + ?Sized,
{
    let mut deadline = rules.idle_timeout.map(|t| Instant::now() + t);
    let mut line = Vec::new();
    let mut idle = true;
    let mut complete = false;

    loop {
        let ch = match src.read_byte(deadline, line.len(), handler) {
            Ok(ch) => ch,
            Err(e @ SessionError::ReadTimeout { .. }) => {
                if !line.is_empty() {
                    tracing::warn!("Timeout: {}", String::from_utf8_lossy(&line));
                }
                if rules.terminate_on_timeout {
                    return Err(e);
                }
                break;
            }
            Err(e @ SessionError::EndOfStream { .. }) => {
                if src.fails_on_eos() {
                    if !line.is_empty() {
                        tracing::warn!("EOS: (ASCII) {}", String::from_utf8_lossy(&line));
                    }
                    return Err(e);
                }
                break;
            }
            Err(SessionError::TerminateInterrupt { .. }) => break,
            Err(e @ SessionError::Shutdown) => return Err(e),
            Err(e) => {
                tracing::error!("ReadLine error - {}", e);
                return Err(e);
            }
        };

        if idle {
            idle = false;
            if let Some(timeout) = rules.packet_timeout {
                deadline = Some(Instant::now() + timeout);
            }
        }

        if rules.is_line_terminator(ch) {
            if rules.include_terminator {
                line.push(ch);
            }
            complete = true;
            break;
        } else if rules.is_ignored(ch) {
            continue;
        } else if rules.backspace_chars.contains(&ch) {
            line.pop();
            continue;
        } else if ch < b' ' && ch != b'\t' {
            continue;
        }

        line.push(ch);
        if line.len() >= rules.max_len {
            complete = true;
            break;
        }
    }

    Ok(if complete || !line.is_empty() { Some(line) } else { None })
}

/// Read one binary packet, asking the handler for the packet length as bytes arrive.
///
/// Returns `Ok(None)` if the stream ended, or a timeout was tolerated, before any
/// byte of a new packet arrived.
pub(crate) fn read_packet<S>(
    src: &mut S,
    rules: &FramingRules,
    handler: &mut dyn PacketHandler,
) -> Result<Option<Vec<u8>>, SessionError>
where
    S: FrameSource + ?Sized,
{
    let max_len = rules.max_len;
    let mut min_len = rules.min_len;
    let mut deadline = rules.idle_timeout.map(|t| Instant::now() + t);

    let mut matcher = rules.terminator.as_deref().and_then(TerminatorMatcher::new);

    let mut packet: Vec<u8> = Vec::with_capacity(max_len.min(4096));
    let mut idle = true;
    let mut complete = false;
    let mut break_on_line_term = false;
    let mut increment_on_line_term = false;
    let mut fail_on_eos = src.fails_on_eos();
    let mut actual_len = 0;

    loop {
        let last = match src.read_byte(deadline, packet.len(), handler) {
            Ok(b) => b,
            Err(_) if src.terminate_requested() => break,
            Err(e @ SessionError::ReadTimeout { .. }) => {
                if fail_on_eos {
                    if !packet.is_empty() {
                        tracing::warn!("Timeout: 0x{}", hex::encode(&packet));
                    }
                    if rules.control || rules.terminate_on_timeout {
                        return Err(e);
                    }
                }
                break;
            }
            Err(e @ SessionError::EndOfStream { .. }) => {
                if fail_on_eos {
                    if !packet.is_empty() {
                        tracing::warn!("EOS: 0x{}", hex::encode(&packet));
                    }
                    return Err(e);
                }
                break;
            }
            Err(SessionError::TerminateInterrupt { .. }) => break,
            Err(e @ SessionError::Shutdown) => return Err(e),
            Err(e) => {
                tracing::error!("ReadPacket error - {}", e);
                return Err(e);
            }
        };

        if idle {
            idle = false;
            if let Some(timeout) = rules.packet_timeout {
                deadline = Some(Instant::now() + timeout);
            }
        }

        if break_on_line_term {
            if rules.is_line_terminator(last) {
                if rules.include_terminator {
                    packet.push(last);
                }
                complete = true;
                break;
            } else if rules.is_ignored(last) {
                continue;
            }
        }
        packet.push(last);

        if packet.len() >= max_len {
            complete = true;
            break;
        }

        if actual_len > 0 {
            if packet.len() >= actual_len {
                complete = true;
                break;
            }
            continue;
        }

        if let Some(m) = matcher.as_mut() {
            if m.push(last) {
                complete = true;
                break;
            }
        }

        if increment_on_line_term && rules.is_line_terminator(last) {
            increment_on_line_term = false;
            min_len = packet.len();
        }

        if packet.len() < min_len {
            continue;
        }

        let directive = handler.packet_length(&packet);
        if src.terminate_requested() {
            break;
        }

        let len = packet.len();
        match directive {
            PacketLength::Exact(n) if n == len => {
                complete = true;
                break;
            }
            PacketLength::Exact(n) if n < len => {
                tracing::error!("Actual length [{}] < Packet length [{}]", n, len);
                complete = true;
                break;
            }
            PacketLength::Exact(n) if n > max_len => {
                tracing::error!("Actual length [{}] > Maximum length [{}]", n, max_len);
                actual_len = max_len;
            }
            PacketLength::Exact(n) => {
                actual_len = n;
            }
            PacketLength::LineTerminator => {
                if rules.is_line_terminator(last) {
                    if !rules.include_terminator {
                        packet.pop();
                    }
                    complete = true;
                    break;
                }
                break_on_line_term = true;
                actual_len = max_len;
            }
            PacketLength::EndOfStream => {
                actual_len = (len + src.available()).min(max_len);
                fail_on_eos = false;
                if actual_len <= len {
                    complete = true;
                    break;
                }
            }
            PacketLength::MoreToLineTerminator => {
                increment_on_line_term = true;
                min_len = max_len;
            }
            PacketLength::More(n) => {
                let wanted = len + n.max(1);
                if wanted > max_len {
                    tracing::warn!("Incremental length [{}] > Maximum length [{}]", wanted, max_len);
                    min_len = max_len;
                } else {
                    min_len = wanted;
                }
            }
            PacketLength::AtLeast(n) => {
                if n > max_len {
                    tracing::warn!("Incremental length [{}] > Maximum length [{}]", n, max_len);
                    min_len = max_len;
                } else {
                    min_len = n.max(len + 1);
                }
            }
            PacketLength::Terminate => {
                src.request_terminate();
                break;
            }
        }
    }

    Ok(if complete || !packet.is_empty() { Some(packet) } else { None })
}
