use thiserror::Error;

fn describe_index(index: &usize) -> String
{
    if *index == 0 { "empty packet".to_string() } else { format!("@ {}", index) }
}

/// An error that ends (or interrupts the framing of) a single session.
///
/// Timeout and end-of-stream errors carry the number of bytes that had been read
/// into the current packet when they occurred; zero means the error happened on a
/// clean packet boundary.
#[derive(Error,Debug)]
pub enum SessionError
{
    #[error("Session timeout")]
    SessionTimeout,
    #[error("Read timeout [{}]", describe_index(.index))]
    ReadTimeout { index: usize },
    #[error("End of stream [{}]", describe_index(.index))]
    EndOfStream { index: usize },
    #[error("End of stream [terminate interrupt detected]")]
    TerminateInterrupt { index: usize },
    #[error("Listener shutting down")]
    Shutdown,
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Packet handler error: {0}")]
    Handler(String),
    #[error("Packet observer error: {0}")]
    Observer(String),
}

impl SessionError
{
    /// The number of bytes of the current packet read before the error, if the
    /// error happened while reading a packet.
    pub fn byte_index(&self) -> Option<usize>
    {
        match self {
            Self::ReadTimeout { index } |
            Self::EndOfStream { index } |
            Self::TerminateInterrupt { index } => Some(*index),
            _ => None,
        }
    }

    /// True for errors which happened part-way through a packet.
    pub fn is_mid_packet(&self) -> bool
    {
        matches!(self.byte_index(), Some(n) if n > 0)
    }

    pub(crate) fn from_handler(e: anyhow::Error) -> Self
    {
        Self::Handler(format!("{:#}", e))
    }
}

/// An error that might occur when configuring or running a listener.
#[derive(Error,Debug)]
pub enum ListenerError
{
    #[error("TLS requested with no TLS config")]
    NoTlsConfig,
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("I/O Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid listener configuration: {0}")]
    InvalidConfig(String),
    #[error("Listener has no bound socket")]
    Detached,
    #[error("Listener already started")]
    AlreadyStarted,
}

impl From<nix::Error> for ListenerError
{
    fn from(e: nix::Error) -> Self
    {
        Self::IoError(e.into())
    }
}

/// An error loading a configuration file.
#[derive(Error,Debug)]
pub enum ConfigError
{
    #[error("I/O Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("TLS key file {0} contains no private key")]
    NoPrivateKey(String),
    #[error("TLS certificate file {0} contains no certificates")]
    NoCertificates(String),
}
