//! Listener and server configuration.
//!
//! [`ListenerConfig`] holds the settings fixed when a listener is bound. The few
//! values that may be changed while the listener runs are copied into a
//! [`RuntimeSettings`] at bind time and read from there by the worker threads.

use crate::error::ConfigError;
use crate::logging::LoggingConfig;

use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufReader,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Default maximum packet length for text listeners
pub const DEFAULT_MAX_TEXT_PACKET: usize = 2048;
/// Default maximum packet length for binary listeners
pub const DEFAULT_MAX_BINARY_PACKET: usize = 1024;

/// Transport over which a listener accepts sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Tls,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Tcp
    }
}

/// Locations of the PEM files used to build a TLS listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert_chain: PathBuf,
    pub key: PathBuf,
}

/// The certificate chain and private key required to create a TLS listener, in DER form.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    pub cert_chain: Vec<Vec<u8>>,
    pub key: Vec<u8>,
}

impl TlsFiles {
    pub fn load(&self) -> Result<TlsSettings, ConfigError> {
        let mut cert_reader = BufReader::new(File::open(&self.cert_chain)?);
        let cert_chain = rustls_pemfile::certs(&mut cert_reader)?;
        if cert_chain.is_empty() {
            return Err(ConfigError::NoCertificates(self.cert_chain.display().to_string()));
        }

        let mut key_reader = BufReader::new(File::open(&self.key)?);
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)?;
        if keys.is_empty() {
            let mut key_reader = BufReader::new(File::open(&self.key)?);
            keys = rustls_pemfile::rsa_private_keys(&mut key_reader)?;
        }
        let key = keys
            .into_iter()
            .next()
            .ok_or_else(|| ConfigError::NoPrivateKey(self.key.display().to_string()))?;

        Ok(TlsSettings { cert_chain, key })
    }
}

impl TlsSettings {
    pub fn server_config(self) -> Result<Arc<rustls::ServerConfig>, rustls::Error> {
        let certs = self.cert_chain.into_iter().map(rustls::Certificate).collect();

        Ok(Arc::new(
            rustls::ServerConfig::builder()
                .with_safe_defaults()
                .with_no_client_auth()
                .with_single_cert(certs, rustls::PrivateKey(self.key))?,
        ))
    }
}

/// (De)serialise byte patterns as hex strings, e.g. `"fa f8"` or `"faf8"`.
mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        match text {
            None => Ok(None),
            Some(text) => {
                let compact: String = text.split_whitespace().collect();
                let bytes = hex::decode(&compact).map_err(D::Error::custom)?;
                Ok(if bytes.is_empty() { None } else { Some(bytes) })
            }
        }
    }
}

/// Settings for a single listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Name used for the listener thread and in log messages
    pub name: Option<String>,
    /// Local interface to bind; all interfaces if unset
    pub bind_address: Option<IpAddr>,
    pub port: u16,
    pub transport: Transport,
    pub tls: Option<TlsFiles>,
    /// Listen backlog for TCP listeners
    pub backlog: u32,
    /// Maximum number of session handler threads; zero for unlimited
    pub max_sessions: usize,

    pub session_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub packet_timeout_ms: u64,
    /// Upper bound on any single blocking read wait, so that `idle_timeout_interrupt`
    /// is called periodically during long waits. Zero to wait for the full timeout.
    pub min_timeout_interval_ms: u64,
    pub terminate_on_timeout: bool,
    pub linger_secs: u32,

    pub text_packets: bool,
    pub min_packet_length: Option<usize>,
    pub max_packet_length: Option<usize>,
    pub line_terminators: Vec<u8>,
    pub backspace_chars: Vec<u8>,
    pub ignore_chars: Vec<u8>,
    pub include_line_terminator: bool,
    /// Fixed byte sequence ending every packet. Setting this implies binary packets.
    #[serde(with = "hex_bytes")]
    pub packet_terminator: Option<Vec<u8>>,

    pub prompt: Option<String>,
    /// Number prompts (`1> `, `2> `, ...) when no explicit prompt is given
    pub auto_prompt: bool,
    pub prompt_enabled: bool,

    /// Header which, when seen at the start of a connection, routes it to the
    /// control channel handler
    #[serde(with = "hex_bytes")]
    pub control_channel_header: Option<Vec<u8>>,

    /// `SO_RCVBUF` for UDP listeners; zero to leave the system default
    pub udp_receive_buffer_size: usize,
    /// Send UDP replies from the listening socket, so that they originate from the
    /// port the client targeted
    pub udp_reply_from_listen_port: bool,
    /// Send UDP replies from a fresh socket bound to this address instead
    pub udp_reply_bind_address: Option<IpAddr>,
    /// Send UDP replies to this port rather than the datagram's source port
    pub remote_port: Option<u16>,

    pub log_enabled: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: None,
            bind_address: None,
            port: 0,
            transport: Transport::Tcp,
            tls: None,
            backlog: 50,
            max_sessions: 0,
            session_timeout_ms: 0,
            idle_timeout_ms: 0,
            packet_timeout_ms: 0,
            min_timeout_interval_ms: 0,
            terminate_on_timeout: true,
            linger_secs: 4,
            text_packets: true,
            min_packet_length: None,
            max_packet_length: None,
            line_terminators: vec![b'\n'],
            backspace_chars: vec![0x08],
            ignore_chars: vec![b'\r'],
            include_line_terminator: false,
            packet_terminator: None,
            prompt: None,
            auto_prompt: false,
            prompt_enabled: true,
            control_channel_header: None,
            udp_receive_buffer_size: 0,
            udp_reply_from_listen_port: true,
            udp_reply_bind_address: None,
            remote_port: None,
            log_enabled: true,
        }
    }
}

impl ListenerConfig {
    pub fn tcp(port: u16) -> Self {
        Self { port, ..Self::default() }
    }

    pub fn udp(port: u16) -> Self {
        Self { port, transport: Transport::Udp, ..Self::default() }
    }

    /// Text packets are disabled by a fixed terminator pattern.
    pub fn is_text(&self) -> bool {
        self.text_packets && self.packet_terminator.is_none()
    }

    pub fn max_packet_length(&self) -> usize {
        match self.max_packet_length {
            Some(len) if len > 0 => len,
            _ if self.is_text() => DEFAULT_MAX_TEXT_PACKET,
            _ => DEFAULT_MAX_BINARY_PACKET,
        }
    }

    pub fn min_packet_length(&self) -> usize {
        match self.min_packet_length {
            Some(len) if len > 0 => len,
            _ if self.is_text() => 1,
            _ => self.max_packet_length(),
        }
    }

    /// Ignore characters only apply to text listeners.
    pub fn ignore_chars(&self) -> &[u8] {
        if self.is_text() { &self.ignore_chars } else { &[] }
    }

    pub fn has_prompt(&self) -> bool {
        self.prompt.is_some() || (self.auto_prompt && self.is_text())
    }

    /// The prompt to display before reading packet number `index`.
    pub fn prompt_for(&self, index: usize) -> Option<Vec<u8>> {
        match &self.prompt {
            Some(p) => Some(p.as_bytes().to_vec()),
            None if self.auto_prompt && self.is_text() => Some(format!("{}> ", index + 1).into_bytes()),
            None => None,
        }
    }

    pub fn packet_terminator(&self) -> Option<&[u8]> {
        self.packet_terminator.as_deref().filter(|p| !p.is_empty())
    }
}

fn optional_duration(ms: u64) -> Option<Duration> {
    if ms > 0 { Some(Duration::from_millis(ms)) } else { None }
}

/// The listener settings which may be changed while sessions are running.
#[derive(Debug)]
pub struct RuntimeSettings {
    session_timeout_ms: AtomicU64,
    idle_timeout_ms: AtomicU64,
    packet_timeout_ms: AtomicU64,
    min_timeout_interval_ms: AtomicU64,
    max_sessions: AtomicUsize,
    prompt_enabled: AtomicBool,
    terminate_on_timeout: AtomicBool,
    log_enabled: AtomicBool,
}

impl RuntimeSettings {
    pub fn new(config: &ListenerConfig) -> Self {
        Self {
            session_timeout_ms: AtomicU64::new(config.session_timeout_ms),
            idle_timeout_ms: AtomicU64::new(config.idle_timeout_ms),
            packet_timeout_ms: AtomicU64::new(config.packet_timeout_ms),
            min_timeout_interval_ms: AtomicU64::new(config.min_timeout_interval_ms),
            max_sessions: AtomicUsize::new(config.max_sessions),
            prompt_enabled: AtomicBool::new(config.prompt_enabled),
            terminate_on_timeout: AtomicBool::new(config.terminate_on_timeout),
            log_enabled: AtomicBool::new(config.log_enabled),
        }
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        optional_duration(self.session_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_session_timeout(&self, timeout: Option<Duration>) {
        self.session_timeout_ms.store(to_ms(timeout), Ordering::Relaxed);
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        optional_duration(self.idle_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.idle_timeout_ms.store(to_ms(timeout), Ordering::Relaxed);
    }

    pub fn packet_timeout(&self) -> Option<Duration> {
        optional_duration(self.packet_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_packet_timeout(&self, timeout: Option<Duration>) {
        self.packet_timeout_ms.store(to_ms(timeout), Ordering::Relaxed);
    }

    pub fn min_timeout_interval(&self) -> Option<Duration> {
        optional_duration(self.min_timeout_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_min_timeout_interval(&self, interval: Option<Duration>) {
        self.min_timeout_interval_ms.store(to_ms(interval), Ordering::Relaxed);
    }

    /// Maximum pool size; zero means unlimited
    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::Relaxed)
    }

    pub fn set_max_sessions(&self, max: usize) {
        self.max_sessions.store(max, Ordering::Relaxed);
    }

    pub fn prompt_enabled(&self) -> bool {
        self.prompt_enabled.load(Ordering::Relaxed)
    }

    pub fn set_prompt_enabled(&self, enabled: bool) {
        self.prompt_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn terminate_on_timeout(&self) -> bool {
        self.terminate_on_timeout.load(Ordering::Relaxed)
    }

    pub fn set_terminate_on_timeout(&self, terminate: bool) {
        self.terminate_on_timeout.store(terminate, Ordering::Relaxed);
    }

    pub fn log_enabled(&self) -> bool {
        self.log_enabled.load(Ordering::Relaxed)
    }

    pub fn set_log_enabled(&self, enabled: bool) {
        self.log_enabled.store(enabled, Ordering::Relaxed);
    }
}

fn to_ms(d: Option<Duration>) -> u64 {
    d.map(|d| d.as_millis().min(u64::MAX as u128) as u64).unwrap_or(0)
}

/// Configuration file for the standalone listener binary.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    pub log: Option<LoggingConfig>,
}

impl ServerConfig {
    pub fn load_file(filename: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(filename)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_follow_packet_mode() {
        let text = ListenerConfig::tcp(1234);
        assert!(text.is_text());
        assert_eq!(text.max_packet_length(), DEFAULT_MAX_TEXT_PACKET);
        assert_eq!(text.min_packet_length(), 1);
        assert_eq!(text.ignore_chars(), b"\r");

        let binary = ListenerConfig { text_packets: false, ..ListenerConfig::tcp(1234) };
        assert_eq!(binary.max_packet_length(), DEFAULT_MAX_BINARY_PACKET);
        assert_eq!(binary.min_packet_length(), DEFAULT_MAX_BINARY_PACKET);
        assert!(binary.ignore_chars().is_empty());
    }

    #[test]
    fn terminator_pattern_forces_binary() {
        let conf: ListenerConfig = serde_json::from_str(
            r#"{ "port": 31000, "packet_terminator": "0d 0a", "control_channel_header": "FAF8" }"#,
        )
        .unwrap();

        assert!(!conf.is_text());
        assert_eq!(conf.packet_terminator(), Some(&b"\r\n"[..]));
        assert_eq!(conf.control_channel_header, Some(vec![0xfa, 0xf8]));
        assert_eq!(conf.transport, Transport::Tcp);
        assert_eq!(conf.backlog, 50);
    }

    #[test]
    fn auto_prompt_numbers_packets() {
        let mut conf = ListenerConfig::tcp(1);
        assert!(!conf.has_prompt());
        assert_eq!(conf.prompt_for(0), None);
        conf.auto_prompt = true;
        assert!(conf.has_prompt());
        assert_eq!(conf.prompt_for(2), Some(b"3> ".to_vec()));
    }

    #[test]
    fn runtime_settings_zero_means_none() {
        let conf = ListenerConfig { idle_timeout_ms: 1500, ..ListenerConfig::udp(5000) };
        let settings = RuntimeSettings::new(&conf);
        assert_eq!(settings.idle_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(settings.session_timeout(), None);

        settings.set_idle_timeout(None);
        settings.set_max_sessions(3);
        assert_eq!(settings.idle_timeout(), None);
        assert_eq!(settings.max_sessions(), 3);
    }
}
