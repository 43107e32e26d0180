//! Tiered File Server
//!
//! Serves files from a directory over a line protocol; with `--adaptive`,
//! clients are released in rounds ordered by their reported pan speed.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::sync::Arc;
use tiered_fileserver::core::config::parse_duration;
use tiered_fileserver::{init_logging, AppState, Config, Error, Result, Server, ServerHandle};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    // Load configuration
    let mut config = if let Some(config_path) = matches.get_one::<String>("config") {
        let mut config = Config::from_file(config_path)?;
        config.apply_env_overrides()?;
        config
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    init_logging(&config.logging)?;
    info!("Starting {} v{}", tiered_fileserver::NAME, tiered_fileserver::VERSION);

    if !config.server.directory.is_dir() {
        warn!("Serving directory {} does not exist", config.server.directory.display());
    }

    let state = Arc::new(AppState::new(config)?);
    let server = Server::bind(state)?;

    eprintln!("Listening on port {}.", server.port());
    if let Some(port) = server.adaptive_port() {
        eprintln!("Scheduler on port {}.", port);
    }

    setup_shutdown_handlers(server.handle());
    server.run().await
}

fn cli() -> Command {
    Command::new(tiered_fileserver::NAME)
        .version(tiered_fileserver::VERSION)
        .about("File server with round-based adaptive scheduling.")
        .arg(
            Arg::new("port")
                .value_name("PORT")
                .help("Port to listen on (default: any free port)")
        )
        .arg(
            Arg::new("adaptive")
                .short('a')
                .long("adaptive")
                .action(ArgAction::SetTrue)
                .help("Enable adaptive scheduling")
        )
        .arg(
            Arg::new("directory")
                .short('d')
                .long("directory")
                .value_name("DIR")
                .help("Serve images from DIR, defaults to imgs/")
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Produce verbose output")
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
        )
        .arg(
            Arg::new("max-workers")
                .long("max-workers")
                .value_name("N")
                .help("Maximum number of worker threads")
        )
        .arg(
            Arg::new("idle-timeout")
                .long("idle-timeout")
                .value_name("DURATION")
                .help("How long an idle worker waits for reuse (e.g. 60s)")
        )
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &ArgMatches) -> Result<()> {
    if let Some(port) = matches.get_one::<String>("port") {
        config.server.port = port.parse()
            .map_err(|e| Error::config(format!("Invalid port: {}", e)))?;
    }

    if matches.get_flag("adaptive") {
        config.server.adaptive = true;
    }

    if let Some(dir) = matches.get_one::<String>("directory") {
        config.server.directory = dir.into();
    }

    if matches.get_flag("verbose") {
        config.logging.level = "debug".to_string();
    }

    if let Some(workers) = matches.get_one::<String>("max-workers") {
        config.pool.max_workers = workers.parse()
            .map_err(|e| Error::config(format!("Invalid worker count: {}", e)))?;
    }

    if let Some(timeout) = matches.get_one::<String>("idle-timeout") {
        config.pool.idle_timeout = parse_duration(timeout)
            .map_err(|e| Error::config(format!("Invalid idle timeout: {}", e)))?;
    }

    Ok(())
}

/// First interrupt shuts down gracefully, the second reports progress, the third exits
fn setup_shutdown_handlers(handle: ServerHandle) {
    let interrupts = handle.clone();
    tokio::spawn(async move {
        let mut presses = 0u32;
        loop {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                return;
            }
            presses += 1;
            match presses {
                1 => {
                    info!("Received Ctrl+C signal");
                    interrupts.shutdown();
                }
                2 => {
                    let stats = interrupts.pool_stats();
                    warn!(
                        "Waiting for {} workers to finish; press Ctrl+C again to force exit",
                        stats.workers
                    );
                }
                _ => {
                    eprintln!("Forced exit.");
                    std::process::exit(1);
                }
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
                handle.shutdown();
            }
            Err(e) => error!("Failed to install signal handler: {}", e),
        }
    });

    #[cfg(not(unix))]
    drop(handle);
}
