//! miniproxy server binary.
//!
//! # Lifecycle
//!
//! ```text
//!   load config ──▶ init logging ──▶ bind ──▶ serve ──┐
//!                                                    │
//!   SIGINT / SIGTERM ──▶ ServerCore::shutdown ◀──────┘
//!                           │
//!                           ├─ drain gate signaled
//!                           ├─ listener closed
//!                           └─ in-flight connections ⟷ shutdown timeout
//!                                        │
//!                                        ▼
//!                                 flush, exit(0)
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use miniproxy::config::{load_config, validate_config, ConfigError, ServerConfig};
use miniproxy::lifecycle::shutdown::exit_process;
use miniproxy::lifecycle::signals::{trigger_on_signals, SignalListener};
use miniproxy::lifecycle::startup;
use miniproxy::observability::logging::init_logging;
use miniproxy::server::EchoHandler;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "miniproxy", version, about = "TCP server with graceful shutdown", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn load(cli: &Cli) -> Result<ServerConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    if let Some(bind) = &cli.bind {
        config.listener.bind_address = bind.clone();
        validate_config(&config).map_err(ConfigError::Validation)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("miniproxy: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli.check {
        println!("configuration ok");
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_logging(&config.observability) {
        eprintln!("miniproxy: failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!(version = VERSION, "miniproxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        read_timeout_secs = config.timeouts.read_secs,
        write_timeout_secs = config.timeouts.write_secs,
        handshake_timeout_secs = config.timeouts.handshake_secs,
        graceful_shutdown_secs = config.timeouts.graceful_shutdown_secs,
        "Configuration loaded"
    );

    let signals = match SignalListener::register() {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!(error = %e, "Failed to register signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let core = match startup::start(&config, VERSION).await {
        Ok(core) => core,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let serve = {
        let core = core.clone();
        tokio::spawn(async move { core.serve(EchoHandler).await })
    };

    {
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(e) = trigger_on_signals(core, signals).await {
                tracing::error!(error = %e, "Signal handling failed");
            }
        });
    }

    let code = tokio::select! {
        _ = core.stopped() => 0,
        res = serve => match res {
            Ok(Ok(())) => {
                // The listener was closed by shutdown; let the drain finish.
                core.stopped().await;
                0
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Server failed");
                core.shutdown().await;
                core.stopped().await;
                1
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept loop task failed");
                core.shutdown().await;
                core.stopped().await;
                1
            }
        },
    };

    exit_process(code, core.outcome(), VERSION)
}
