//! Log output configuration for servers built on this crate.
//!
//! Every listener runs on a thread named after it, and each of its session
//! handlers on a thread named `<listener>/<handler>`, so a log target can be
//! restricted to the traffic of particular listeners.

use tracing::{Metadata, Subscriber};
use tracing_core::LevelFilter;
use tracing_subscriber::{filter::filter_fn, prelude::*, registry::LookupSpan, Layer};

use std::{
    collections::HashMap,
    io::Error as IoError,
    path::{Path, PathBuf},
};

#[derive(Clone,Debug,serde::Serialize,serde::Deserialize)]
#[serde(rename_all="lowercase")]
pub enum BuiltinLogTarget
{
    Stdout,
    Stderr,
}

#[derive(Clone,Debug,serde::Serialize,serde::Deserialize)]
#[serde(untagged)]
pub enum LogTarget
{
    /// A daily rolling file in the configured log directory
    File { filename: PathBuf },
    Builtin(BuiltinLogTarget),
}

#[derive(Clone,Copy,Debug,serde::Serialize,serde::Deserialize)]
#[serde(rename_all ="lowercase")]
pub enum LogLevel
{
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

#[derive(Clone,Debug,serde::Deserialize)]
pub struct LogEntry
{
    pub target: LogTarget,
    /// Module path prefixes to accept; all modules if empty
    #[serde(default)]
    pub modules: Vec<String>,
    /// Names of the listeners whose threads may write here; any thread if empty
    #[serde(default)]
    pub listeners: Vec<String>,
    pub level: Option<LogLevel>,
}

#[derive(Clone,Debug,serde::Deserialize)]
#[serde(rename_all="kebab-case")]
pub struct LoggingConfig
{
    /// Directory for file log targets
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    pub default_level: Option<LogLevel>,
    #[serde(default)]
    pub module_levels: HashMap<String, LogLevel>,
    pub targets: Vec<LogEntry>,
}

fn default_log_dir() -> PathBuf
{
    PathBuf::from("log")
}

impl From<LogLevel> for LevelFilter
{
    fn from(arg: LogLevel) -> LevelFilter
    {
        match arg
        {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info  => LevelFilter::INFO,
            LogLevel::Warn  => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off   => LevelFilter::OFF,
        }
    }
}

/// True if the current thread belongs to one of `listeners`.
fn on_listener_thread(listeners: &[String]) -> bool
{
    let current = std::thread::current();
    let thread = match current.name() {
        Some(name) => name,
        None => return false,
    };

    listeners.iter().any(|listener| {
        thread
            .strip_prefix(listener.as_str())
            .map_or(false, |rest| rest.is_empty() || rest.starts_with('/'))
    })
}

impl LogEntry
{
    fn accepts(&self, metadata: &Metadata<'_>, level: LevelFilter) -> bool
    {
        if metadata.level() > &level
        {
            return false;
        }

        let module_ok = self.modules.is_empty()
            || metadata.module_path().map_or(true, |module| self.modules.iter().any(|m| module.starts_with(m.as_str())));

        module_ok && (self.listeners.is_empty() || on_listener_thread(&self.listeners))
    }

    fn into_layer<S>(self, dir: &Path) -> Box<dyn Layer<S> + Send + Sync + 'static>
        where S: Subscriber + Send + Sync,
              for<'span> S: LookupSpan<'span>,
    {
        let output = tracing_subscriber::fmt::layer().with_thread_names(true);

        let layer = match &self.target
        {
            LogTarget::File { filename } => output.with_writer(tracing_appender::rolling::daily(dir, filename))
                                                  .with_ansi(false)
                                                  .boxed(),
            LogTarget::Builtin(BuiltinLogTarget::Stdout) => output.with_writer(std::io::stdout).boxed(),
            LogTarget::Builtin(BuiltinLogTarget::Stderr) => output.with_writer(std::io::stderr).boxed(),
        };

        let level = self.level.map(LevelFilter::from).unwrap_or(LevelFilter::TRACE);
        layer.with_filter(filter_fn(move |metadata| self.accepts(metadata, level))).boxed()
    }
}

/// Build a subscriber writing to every target in `conf`.
///
/// The caller is responsible for installing it, e.g. with
/// `tracing_subscriber::util::SubscriberInitExt::init`.
pub fn build_subscriber(conf: LoggingConfig) -> Result<impl Subscriber + Send + Sync, IoError>
{
    let LoggingConfig { dir, default_level, module_levels, targets } = conf;

    if targets.iter().any(|t| matches!(t.target, LogTarget::File { .. }))
    {
        std::fs::create_dir_all(&dir)?;
    }

    let layers: Vec<_> = targets.into_iter().map(|target| target.into_layer(&dir)).collect();

    // Per-target filters do the real selection; this one only trims noisy modules
    let filter = tracing_subscriber::filter::Targets::new()
                    .with_default(LevelFilter::from(default_level.unwrap_or(LogLevel::Trace)))
                    .with_targets(module_levels.into_iter().map(|(m, l)| (m, LevelFilter::from(l))));

    Ok(tracing_subscriber::registry()
            .with(filter)
            .with(layers)
        )
}
