//! A generic threaded socket server.
//!
//! A [`Listener`] accepts TCP (optionally TLS) connections or UDP datagrams and hands
//! each one to a pooled session handler thread. The session reads packets using
//! configurable framing rules (text lines, handler-negotiated lengths or a fixed
//! terminator pattern) and passes each one to a [`PacketHandler`] supplied by the
//! application, writing back whatever response it returns.
//!
//! ```no_run
//! use socket_server::*;
//!
//! struct Echo;
//!
//! impl PacketHandler for Echo {
//!     fn handle_packet(&mut self, packet: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
//!         let mut response = packet.to_vec();
//!         response.push(b'\n');
//!         Ok(Some(response))
//!     }
//! }
//!
//! # fn main() -> Result<(), ListenerError> {
//! let registry = ListenerRegistry::new();
//! let listener = Listener::bind(ListenerConfig::tcp(1234), Handlers::new(|| Echo))?;
//! listener.start(&registry)?;
//! // ...
//! registry.shutdown_all(std::time::Duration::from_secs(5));
//! # Ok(())
//! # }
//! ```

pub mod id;
pub use id::*;

pub mod error;
pub use error::*;

pub mod config;
pub use config::{ListenerConfig, RuntimeSettings, ServerConfig, TlsFiles, TlsSettings, Transport};

pub mod logging;

mod protocols;
pub use protocols::*;

mod pattern;
pub use pattern::TerminatorMatcher;

mod framer;

mod client_socket;
pub use client_socket::{send_datagram, SocketKind};

mod session;
pub use session::{SessionEnd, SessionInfo, SessionReport, SessionSummary};

mod listener;
pub use listener::Listener;

mod registry;
pub use registry::ListenerRegistry;
