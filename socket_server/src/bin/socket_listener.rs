use socket_server::*;

use std::{
    io::BufRead,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use structopt::StructOpt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab")]
struct Opts {
    /// Port to listen on
    #[structopt(short, long, default_value = "1234")]
    port: u16,

    /// Listen for UDP datagrams instead of TCP connections
    #[structopt(short, long)]
    udp: bool,

    /// Local address to bind
    #[structopt(short, long)]
    bind: Option<IpAddr>,

    /// Server config file; its listeners replace the one described on the command line
    #[structopt(short, long)]
    config: Option<PathBuf>,
}

/// Echoes each packet back. A session ends when the peer sends `bye`.
#[derive(Default)]
struct Echo {
    session: Option<SessionInfo>,
    text: bool,
}

impl PacketHandler for Echo {
    fn session_started(&mut self, session: &SessionInfo, remote: Option<SocketAddr>, _is_duplex: bool, is_text: bool) {
        self.session = Some(session.clone());
        self.text = is_text;
        if let Some(remote) = remote {
            session.set_session_id(Some(remote.ip().to_string()));
        }
    }

    fn initial_packet(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.text.then(|| b"Echo server ready\n".to_vec()))
    }

    fn handle_packet(&mut self, packet: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if packet == b"bye" {
            if let Some(session) = &self.session {
                session.terminate_session();
            }
            return Ok(None);
        }

        let mut response = packet.to_vec();
        if self.text {
            response.push(b'\n');
        }
        Ok(Some(response))
    }

    fn final_packet(&mut self, had_error: bool) -> anyhow::Result<Option<Vec<u8>>> {
        Ok((self.text && !had_error).then(|| b"Goodbye\n".to_vec()))
    }
}

pub fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();

    let server_config = match &opts.config {
        Some(path) => Some(ServerConfig::load_file(path)?),
        None => None,
    };

    match server_config.as_ref().and_then(|c| c.log.clone()) {
        Some(log) => logging::build_subscriber(log)?.init(),
        None => tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init(),
    }

    let configs = match server_config {
        Some(conf) if !conf.listeners.is_empty() => conf.listeners,
        _ => {
            let mut conf = if opts.udp { ListenerConfig::udp(opts.port) } else { ListenerConfig::tcp(opts.port) };
            conf.bind_address = opts.bind;
            vec![conf]
        }
    };

    let registry = ListenerRegistry::new();
    for conf in configs {
        let listener = Listener::bind(conf, Handlers::new(Echo::default))?;
        listener.start(&registry)?;
    }

    tracing::info!("Type 'quit' to stop");
    for line in std::io::stdin().lock().lines() {
        match line?.trim() {
            "quit" => break,
            "sessions" => {
                for listener in registry.listeners() {
                    listener.log_active_sessions("Active sessions");
                }
            }
            _ => (),
        }
    }

    if !registry.shutdown_all(Duration::from_secs(5)) {
        tracing::warn!("Some sessions did not finish before shutdown");
    }
    Ok(())
}
