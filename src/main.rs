//! kvnode -- replicated key-value node and proxy.
//!
//! Every startup decides between a fresh start and recovery from the data
//! directory.  Any startup or serving error is fatal: it is logged with
//! its category and the process exits non-zero.

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kvnode::cli::{strip_deprecated_flags, Cli};
use kvnode::config::LoggingConfig;
use kvnode::errors::StartupError;

#[tokio::main]
async fn main() {
    let (args, ignored) = strip_deprecated_flags(std::env::args());
    let cli = Cli::parse_from(args);

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&LoggingConfig::default());
            fail(StartupError::Config(e));
        }
    };
    init_tracing(&config.logging);

    for flag in &ignored {
        warn!(flag = %flag, "The flag is deprecated and will be ignored");
    }

    // Initialize Prometheus metrics recorder and register metric descriptions.
    kvnode::metrics::init_metrics();
    kvnode::metrics::describe_metrics();

    info!(name = %config.name, proxy = ?config.proxy, "Starting kvnode");
    if let Err(e) = kvnode::startup::run(&config).await {
        fail(e);
    }
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn fail(err: StartupError) -> ! {
    error!(category = err.category(), "{err}");
    std::process::exit(1);
}
