mod utils;

use pretty_assertions::assert_eq;
use socket_server::*;
use utils::*;

use std::{
    io::{self, Cursor, Read},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

fn run(config: ListenerConfig, handlers: Handlers, input: &[u8], output: &SharedBuffer, mode: StreamMode) -> SessionReport {
    init_logging();
    let listener = Listener::detached(config, handlers);
    listener.run_stream_session(Cursor::new(input.to_vec()), output.boxed(), mode)
}

#[test]
fn text_lines() {
    let recording = Recording::default();
    let output = SharedBuffer::default();

    let report = run(ListenerConfig::tcp(0), recorder(&recording), b"HELLO\r\nWORLD\n", &output, StreamMode::MimicTcp);

    assert_eq!(report.end, SessionEnd::Normal);
    assert!(report.error.is_none());
    assert_eq!(recording.packets(), vec![b"HELLO".to_vec(), b"WORLD".to_vec()]);
    assert_eq!(output.contents(), b"HELLO\nWORLD\n".to_vec());
    assert_eq!(report.bytes_read, 13);
    assert_eq!(report.bytes_written, 12);
    assert_eq!(report.packets_read, 2);
    assert_eq!(recording.started(), vec![(None, true, true)]);
}

#[test]
fn include_line_terminator() {
    let recording = Recording::default();
    let config = ListenerConfig { include_line_terminator: true, ..ListenerConfig::tcp(0) };

    run(config, recorder(&recording), b"HELLO\r\n", &SharedBuffer::default(), StreamMode::MimicTcp);

    assert_eq!(recording.packets(), vec![b"HELLO\n".to_vec()]);
}

#[test]
fn text_lines_capped_at_maximum() {
    let recording = Recording::default();
    let config = ListenerConfig { max_packet_length: Some(4), ..ListenerConfig::tcp(0) };

    run(config, recorder(&recording), b"0123456789\n", &SharedBuffer::default(), StreamMode::MimicUdp);

    assert_eq!(recording.packets(), vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);
}

#[test]
fn fixed_length_binary_packets() {
    let recording = Recording::default();
    let config = ListenerConfig { text_packets: false, max_packet_length: Some(4), ..ListenerConfig::tcp(0) };
    let handlers = {
        let recording = recording.clone();
        Handlers::new(move || Recorder::fixed_length(&recording, 4))
    };

    let report = run(config, handlers, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], &SharedBuffer::default(), StreamMode::MimicUdp);

    assert_eq!(report.end, SessionEnd::Normal);
    assert_eq!(recording.packets(), vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10]]);
    assert_eq!(recording.started(), vec![(None, false, false)]);
}

#[test]
fn terminator_pattern() {
    let recording = Recording::default();
    let config = ListenerConfig { packet_terminator: Some(b"##".to_vec()), ..ListenerConfig::tcp(0) };

    run(config, recorder(&recording), b"abc##def##", &SharedBuffer::default(), StreamMode::MimicUdp);

    assert_eq!(recording.packets(), vec![b"abc##".to_vec(), b"def##".to_vec()]);
}

#[test]
fn handler_terminates_session() {
    let recording = Recording::default();
    let output = SharedBuffer::default();

    let report = run(ListenerConfig::tcp(0), recorder(&recording), b"one\nbye\ntwo\n", &output, StreamMode::MimicTcp);

    assert_eq!(report.end, SessionEnd::Terminated);
    assert!(report.error.is_none());
    assert_eq!(recording.packets(), vec![b"one".to_vec(), b"bye".to_vec()]);
    assert_eq!(output.contents(), b"one\n".to_vec());
}

#[test]
fn handler_error_ends_session() {
    let recording = Recording::default();

    let report = run(ListenerConfig::tcp(0), recorder(&recording), b"fail\nnext\n", &SharedBuffer::default(), StreamMode::MimicTcp);

    assert_eq!(report.end, SessionEnd::Error);
    assert!(matches!(report.error, Some(SessionError::Handler(ref msg)) if msg.contains("refusing packet")));
    assert_eq!(recording.packets(), vec![b"fail".to_vec()]);

    let ended = recording.ended();
    assert_eq!(ended.len(), 1);
    assert!(ended[0].error.as_deref().unwrap_or_default().contains("refusing packet"));
}

#[test]
fn handler_panic_is_contained() {
    let recording = Recording::default();

    let report = run(ListenerConfig::tcp(0), recorder(&recording), b"panic\nnext\n", &SharedBuffer::default(), StreamMode::MimicTcp);

    assert_eq!(report.end, SessionEnd::Error);
    assert!(matches!(report.error, Some(SessionError::Handler(ref msg)) if msg.contains("handler panicked")));
    assert_eq!(recording.ended().len(), 1);
}

#[test]
fn suppressed_responses() {
    let recording = Recording::default();
    let output = SharedBuffer::default();

    run(ListenerConfig::tcp(0), recorder(&recording), b"a\nquiet\nb\n", &output, StreamMode::MimicTcp);

    // Suppression only applies to the packet being handled
    assert_eq!(recording.packets().len(), 3);
    assert_eq!(output.contents(), b"a\nb\n".to_vec());
}

#[derive(Default)]
struct Counter(AtomicUsize);

impl PacketObserver for Counter {
    fn packet_received(&self, _session: &SessionInfo, _packet: &[u8]) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct Refuse;

impl PacketObserver for Refuse {
    fn packet_received(&self, _session: &SessionInfo, packet: &[u8]) -> anyhow::Result<()> {
        anyhow::bail!("observer rejected {} bytes", packet.len())
    }
}

#[test]
fn observers_see_every_packet() {
    init_logging();
    let recording = Recording::default();
    let counter = Arc::new(Counter::default());

    let listener = Listener::detached(ListenerConfig::tcp(0), recorder(&recording));
    listener.add_observer(counter.clone());
    listener.run_stream_session(Cursor::new(b"a\nb\nc\n".to_vec()), None, StreamMode::MimicUdp);

    assert_eq!(counter.0.load(Ordering::Relaxed), 3);
    assert_eq!(recording.packets().len(), 3);
}

#[test]
fn observer_failure_ends_session() {
    init_logging();
    let recording = Recording::default();

    let listener = Listener::detached(ListenerConfig::tcp(0), recorder(&recording));
    listener.add_observer(Arc::new(Refuse));
    let report = listener.run_stream_session(Cursor::new(b"a\nb\n".to_vec()), None, StreamMode::MimicUdp);

    assert_eq!(report.end, SessionEnd::Error);
    assert!(matches!(report.error, Some(SessionError::Observer(_))));
    assert!(recording.packets().is_empty());
}

#[test]
fn legacy_length_codes() {
    struct Legacy;

    impl PacketHandler for Legacy {
        fn packet_length(&mut self, packet: &[u8]) -> PacketLength {
            // First byte is the length of the whole packet
            match packet.len() {
                1 => PacketLength::from_raw(PACKET_LEN_INCREMENTAL | packet[0] as i32),
                n => PacketLength::Exact(n),
            }
        }

        fn handle_packet(&mut self, packet: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(Some(packet[1..].to_vec()))
        }
    }

    init_logging();
    let config = ListenerConfig { text_packets: false, min_packet_length: Some(1), ..ListenerConfig::tcp(0) };
    let output = SharedBuffer::default();
    let listener = Listener::detached(config, Handlers::new(|| Legacy));

    let report = listener.run_stream_session(Cursor::new(b"\x04abc\x03de".to_vec()), output.boxed(), StreamMode::MimicTcp);

    assert_eq!(report.packets_read, 2);
    assert_eq!(output.contents(), b"abcde".to_vec());
}

/// Yields its data in one read, then blocks until released.
struct Stalling {
    data: Option<Vec<u8>>,
    release: mpsc::Receiver<()>,
}

impl Read for Stalling {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.data.take() {
            Some(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            None => {
                let _ = self.release.recv_timeout(Duration::from_secs(10));
                Ok(0)
            }
        }
    }
}

#[test]
fn stream_ends_when_nothing_is_buffered() {
    init_logging();
    let recording = Recording::default();
    let (_release, rx) = mpsc::channel();
    let input = Stalling { data: Some(b"a\n".to_vec()), release: rx };

    let listener = Listener::detached(ListenerConfig::tcp(0), recorder(&recording));
    let started = Instant::now();
    let report = listener.run_stream_session(input, None, StreamMode::MimicUdp);

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.end, SessionEnd::Normal);
    assert_eq!(recording.packets(), vec![b"a".to_vec()]);
}
