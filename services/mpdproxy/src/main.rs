//! mpdproxy
//!
//! Transparent TCP relay. Accepts clients, opens a matching connection to the
//! configured upstream and copies bytes both ways until either side closes.
//!
//! This binary:
//! - Parses the command line and the configuration file
//! - Sets up logging (stderr or file)
//! - Binds the listener and serves until SIGINT/SIGTERM
//! - Drains every relay worker before exiting
//!
//! Exit status: 0 after a requested shutdown, the signal number after a
//! signal, the OS error number after a fatal startup or accept error, 1 for
//! configuration errors.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use mpdproxy::{logging, run, Cli, Config, Proxy, ShutdownCoordinator, WorkerRegistry};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("E: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(
        config.log_file.as_deref(),
        &config.log_level,
        config.log_format,
    ) {
        eprintln!("E: failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %format_args!("{}:{}", config.listen.host, config.listen.port),
        upstream = %format_args!("{}:{}", config.upstream.host, config.upstream.port),
        "Starting mpdproxy"
    );

    let registry = Arc::new(WorkerRegistry::new());
    let proxy = match Proxy::bind(&config.settings(), Arc::clone(&registry)).await {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(
                component = e.component(),
                errno = e.errno(),
                error = %e,
                "Startup failed"
            );
            return ExitCode::from(e.exit_code());
        }
    };

    let coordinator = Arc::new(ShutdownCoordinator::new(registry));
    if let Err(e) = Arc::clone(&coordinator).watch_signals() {
        error!(
            component = "shutdown",
            errno = e.raw_os_error(),
            error = %e,
            "Cannot install signal handlers"
        );
        return ExitCode::from(
            e.raw_os_error()
                .and_then(|errno| u8::try_from(errno).ok())
                .unwrap_or(1),
        );
    }

    match run(proxy, coordinator).await {
        Ok(trigger) => {
            info!(trigger = %trigger, "mpdproxy shutdown complete");
            ExitCode::from(trigger.exit_code())
        }
        Err(e) => ExitCode::from(e.exit_code()),
    }
}
