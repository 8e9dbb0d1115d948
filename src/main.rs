//! dcc-bridge: JSON-RPC control bridge for single-threaded 3D content-creation hosts
//!
//! The standalone binary runs the protocol server on a current-thread runtime
//! and the headless scene on a dedicated host thread.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use dcc_bridge::bridge;
use dcc_bridge::config::{self, TransportKind};
use dcc_bridge::host::scene::SceneHost;
use dcc_bridge::host::tools::register_scene_tools;
use dcc_bridge::host::{HostLoop, HostOperations};
use dcc_bridge::registry::ToolRegistry;
use dcc_bridge::rpc::{shutdown_signal, ProtocolServer};

const RUNTIME_SHUTDOWN: Duration = Duration::from_millis(250);

/// JSON-RPC control bridge for single-threaded 3D content-creation hosts.
///
/// Accepts client connections, queues tool calls for the host thread and
/// returns their results.
#[derive(Parser, Debug)]
#[command(name = "dcc-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Override the configured transport
    #[arg(short, long, value_enum)]
    transport: Option<TransportKind>,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber. Logs go to stderr so stdout stays free
/// for the stdio transport.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn scene_factory(config: config::SceneConfig) -> impl FnOnce() -> Option<Box<dyn HostOperations>> + Send {
    move || match SceneHost::new(&config) {
        Ok(scene) => Some(Box::new(scene) as Box<dyn HostOperations>),
        Err(e) => {
            error!(error = %e, "cannot create scene, running without a host");
            None
        }
    }
}

/// Entry point for the dcc-bridge server.
fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(transport) = args.transport {
        cfg.server.transport = transport;
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }

    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    // GPL license notice (GPLv3 Section 5d)
    eprintln!(
        "dcc-bridge {}  Copyright (C) 2026  The dcc-bridge Developers",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("This program comes with ABSOLUTELY NO WARRANTY.");
    eprintln!("This is free software, licensed under GPL-3.0-or-later.");
    eprintln!();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?cfg.server.transport,
        "Starting dcc-bridge"
    );

    let registry = Arc::new(ToolRegistry::new());
    register_scene_tools(&registry);
    info!(tools = registry.len(), "Tools registered");

    if let Some(path) = &cfg.tools_manifest_path {
        match registry.write_manifest(path) {
            Ok(()) => info!(path = %path.display(), "Tool manifest written"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write tool manifest"),
        }
    }

    // The server spends the shutdown grace draining sessions while the host
    // keeps ticking; whatever is still queued after that has no one waiting.
    let (server_end, host_end) = bridge::channel();
    let host_loop = match HostLoop::spawn(
        scene_factory(cfg.scene.clone()),
        Arc::clone(&registry),
        host_end,
        cfg.scheduler.clone(),
        Duration::ZERO,
    ) {
        Ok(host_loop) => host_loop,
        Err(e) => {
            error!(error = %e, "Failed to start host thread");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            host_loop.shutdown();
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let server = ProtocolServer::start(registry, server_end, &cfg);
        server.run(&cfg.server, shutdown_signal()).await
    });
    // Sessions are drained by now. A pending stdin read must not hold up exit.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);

    let report = host_loop.shutdown();
    info!(
        executed = report.executed,
        abandoned = report.abandoned,
        "Host drained"
    );

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn verbosity_overrides_config_level() {
        assert_eq!(get_log_level(0, false, "debug"), Level::DEBUG);
        assert_eq!(get_log_level(0, false, "bogus"), Level::WARN);
        assert_eq!(get_log_level(2, false, "error"), Level::DEBUG);
        assert_eq!(get_log_level(3, true, "trace"), Level::ERROR);
    }
}
