#![allow(dead_code)]

use parking_lot::Mutex;
use socket_server::*;

use std::{
    io::{self, Write},
    net::SocketAddr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}

pub fn loopback(mut config: ListenerConfig) -> ListenerConfig {
    config.bind_address = Some("127.0.0.1".parse().unwrap());
    config
}

/// How a recorded session ended
#[derive(Clone, Debug)]
pub struct Ended {
    pub error: Option<String>,
    pub mid_packet: bool,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Default)]
pub struct Record {
    pub started: Vec<(Option<SocketAddr>, bool, bool)>,
    pub packets: Vec<Vec<u8>>,
    pub ended: Vec<Ended>,
    pub interrupts: usize,
}

/// Shared record of what every session created from a [`recorder`] factory saw.
#[derive(Clone, Default)]
pub struct Recording(Arc<Mutex<Record>>);

impl Recording {
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.0.lock().packets.clone()
    }

    pub fn ended(&self) -> Vec<Ended> {
        self.0.lock().ended.clone()
    }

    pub fn started(&self) -> Vec<(Option<SocketAddr>, bool, bool)> {
        self.0.lock().started.clone()
    }

    pub fn interrupts(&self) -> usize {
        self.0.lock().interrupts
    }

    /// Wait for `count` sessions to have ended.
    pub fn wait_ended(&self, count: usize, timeout: Duration) -> Vec<Ended> {
        wait_for(timeout, || self.0.lock().ended.len() >= count);
        self.ended()
    }
}

/// Echoes packets and records everything that happens.
///
/// Some packets are commands: `bye` ends the session, `fail` returns an error,
/// `panic` panics, `quiet` turns responses off, and `ID:<name>` names the session.
/// In binary mode a packet starting with `!` makes the length callback panic.
pub struct Recorder {
    recording: Recording,
    session: Option<SessionInfo>,
    text: bool,
    fixed_length: Option<usize>,
}

impl Recorder {
    pub fn new(recording: &Recording) -> Self {
        Self { recording: recording.clone(), session: None, text: true, fixed_length: None }
    }

    pub fn fixed_length(recording: &Recording, length: usize) -> Self {
        Self { fixed_length: Some(length), ..Self::new(recording) }
    }
}

pub fn recorder(recording: &Recording) -> Handlers {
    let recording = recording.clone();
    Handlers::new(move || Recorder::new(&recording))
}

impl PacketHandler for Recorder {
    fn session_started(&mut self, session: &SessionInfo, remote: Option<SocketAddr>, is_duplex: bool, is_text: bool) {
        self.session = Some(session.clone());
        self.text = is_text;
        self.recording.0.lock().started.push((remote, is_duplex, is_text));
    }

    fn packet_length(&mut self, packet: &[u8]) -> PacketLength {
        if packet.first() == Some(&b'!') {
            panic!("length callback panicked");
        }
        match self.fixed_length {
            Some(len) => PacketLength::Exact(len),
            None => PacketLength::Exact(packet.len()),
        }
    }

    fn handle_packet(&mut self, packet: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.recording.0.lock().packets.push(packet.to_vec());
        let session = self.session.as_ref().ok_or_else(|| anyhow::anyhow!("no session"))?;

        match packet {
            b"bye" => {
                session.terminate_session();
                return Ok(None);
            }
            b"fail" => anyhow::bail!("refusing packet"),
            b"panic" => panic!("handler panicked"),
            b"quiet" => session.set_send_response(false),
            _ => (),
        }

        if let Some(id) = packet.strip_prefix(b"ID:") {
            session.set_session_id(Some(String::from_utf8_lossy(id).into_owned()));
            return Ok(Some(b"ok\n".to_vec()));
        }

        let mut response = packet.to_vec();
        if self.text {
            response.push(b'\n');
        }
        Ok(Some(response))
    }

    fn session_terminated(&mut self, error: Option<&SessionError>, bytes_read: u64, bytes_written: u64) {
        self.recording.0.lock().ended.push(Ended {
            error: error.map(ToString::to_string),
            mid_packet: error.map(SessionError::is_mid_packet).unwrap_or(false),
            bytes_read,
            bytes_written,
        });
    }

    fn idle_timeout_interrupt(&mut self) {
        self.recording.0.lock().interrupts += 1;
    }
}

/// A `Write` whose contents can be inspected after the session owning it has finished.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn boxed(&self) -> Option<Box<dyn Write + Send>> {
        Some(Box::new(self.clone()))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
