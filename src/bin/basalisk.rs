//! Basalisk service binary.
//!
//! Subscribes to the request fan-out, pushes notifications to the collector,
//! and keeps serving until the process is terminated.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use basalisk::bus::{TcpPublisher, TcpSubscriber};
use basalisk::{Dispatcher, DurableStore, PatternSetManager, ServiceConfig, StatusReporter};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "basalisk")]
#[command(author, version, about = "Regex scanning service over a message bus", long_about = None)]
struct Cli {
    /// Address of the request fan-out to subscribe to
    #[arg(long, env = "BASALISK_SUBSCRIBE_ADDR", default_value = basalisk::config::DEFAULT_SUBSCRIBE_ADDR)]
    subscribe_addr: String,

    /// Address to push notifications to
    #[arg(long, env = "BASALISK_PUSH_ADDR", default_value = basalisk::config::DEFAULT_PUSH_ADDR)]
    push_addr: String,

    /// Directory for the persisted matcher and expression list
    #[arg(long, env = "BASALISK_STATE_DIR", default_value = "./basalisk-state")]
    state_dir: PathBuf,

    /// Name reported in status responses and invalidations
    #[arg(long, env = "BASALISK_SERVICE_NAME", default_value = basalisk::config::DEFAULT_SERVICE_NAME)]
    service_name: String,

    /// Compiled regex size limit in bytes
    #[arg(long, env = "BASALISK_REGEX_SIZE_LIMIT")]
    regex_size_limit: Option<usize>,

    /// Largest bus frame accepted or sent, in bytes
    #[arg(long, env = "BASALISK_MAX_FRAME_BYTES")]
    max_frame_bytes: Option<usize>,

    /// Append logs to this file instead of stderr
    #[arg(long, env = "BASALISK_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> ServiceConfig {
        let defaults = ServiceConfig::default();
        ServiceConfig {
            service_name: self.service_name.clone(),
            subscribe_addr: self.subscribe_addr.clone(),
            push_addr: self.push_addr.clone(),
            state_dir: self.state_dir.clone(),
            regex_size_limit: self.regex_size_limit.unwrap_or(defaults.regex_size_limit),
            max_frame_bytes: self.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
            ..defaults
        }
    }
}

/// `RUST_LOG` decides the level unless `--verbose` asks for debug; with
/// neither, the service logs at info.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> anyhow::Result<EnvFilter> {
    let filter = match rust_log.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid {} value {directives:?}", EnvFilter::DEFAULT_ENV))?,
        None => EnvFilter::new("info"),
    };
    Ok(if verbose {
        filter.add_directive(tracing::Level::DEBUG.into())
    } else {
        filter
    })
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = log_filter(cli.verbose, rust_log.as_deref())?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let subscriber = builder.with_ansi(false).with_writer(Mutex::new(file)).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = cli.config().validate()?;
    let store = DurableStore::open(&config)
        .with_context(|| format!("opening state directory {}", config.state_dir.display()))?;
    let patterns = Arc::new(PatternSetManager::initialize(store)?);
    let status = StatusReporter::new(&config.service_name);

    info!(
        service = %config.service_name,
        subscribe = %config.subscribe_addr,
        push = %config.push_addr,
        patterns = patterns.current().expressions.len(),
        "basalisk starting"
    );

    let mut delay = Duration::from_millis(250);
    loop {
        match connect(&config) {
            Ok((mut subscriber, publisher)) => {
                delay = Duration::from_millis(250);
                let mut dispatcher = Dispatcher::new(Arc::clone(&patterns), status.clone(), publisher);
                let stats = dispatcher.run(&mut subscriber);
                warn!(handled = stats.handled, "bus closed; reconnecting");
            }
            Err(e) => {
                error!(error = %e, retry_in_ms = delay.as_millis(), "bus connection failed");
            }
        }
        thread::sleep(delay);
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

fn connect(config: &ServiceConfig) -> Result<(TcpSubscriber, TcpPublisher), basalisk::TransportError> {
    let subscriber = TcpSubscriber::connect(&config.subscribe_addr, config.max_frame_bytes)?;
    let publisher = TcpPublisher::connect(&config.push_addr, config.max_frame_bytes)?;
    Ok((subscriber, publisher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::layer::Layer;
    use tracing_subscriber::Registry;

    fn max_level(filter: &EnvFilter) -> Option<LevelFilter> {
        Layer::<Registry>::max_level_hint(filter)
    }

    #[test]
    fn test_rust_log_sets_the_level() {
        assert_eq!(max_level(&log_filter(false, Some("error")).unwrap()), Some(LevelFilter::ERROR));
        assert_eq!(max_level(&log_filter(false, Some("debug")).unwrap()), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_default_level_is_info() {
        assert_eq!(max_level(&log_filter(false, None).unwrap()), Some(LevelFilter::INFO));
        assert_eq!(max_level(&log_filter(false, Some("  ")).unwrap()), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_verbose_raises_to_debug() {
        assert_eq!(max_level(&log_filter(true, None).unwrap()), Some(LevelFilter::DEBUG));
        assert_eq!(max_level(&log_filter(true, Some("warn")).unwrap()), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_invalid_rust_log_is_rejected() {
        assert!(log_filter(false, Some("basalisk=notalevel")).is_err());
    }
}
