//! Partymic Server - headless karaoke session controller.
//!
//! This binary wires the core services together and serves the HTTP/SSE
//! surface that phones on the local hotspot talk to. Hotspot, DNS and
//! firewall provisioning as well as TLS termination are left to the
//! deployment around it.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use partymic_core::{bootstrap_services, sink_name, start_server};
use tokio::signal;

use crate::config::ServerConfig;

/// Partymic Server - karaoke session controller for UltraStar Deluxe.
#[derive(Parser, Debug)]
#[command(name = "partymic-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PARTYMIC_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "PARTYMIC_PORT")]
    port: Option<u16>,

    /// Path to the UltraStar Deluxe directory.
    #[arg(long, env = "PARTYMIC_USDX_DIR")]
    usdx_dir: Option<PathBuf>,

    /// Playlist filename inside the game's playlists directory.
    #[arg(long)]
    playlist_name: Option<String>,

    /// Audio extension of the song library (e.g. m4a, mp3).
    #[arg(long)]
    audio_format: Option<String>,

    /// Path to the game's log file for playlist automation.
    #[arg(long)]
    usdx_log_file: Option<PathBuf>,

    /// Default countdown seconds before every automation step.
    #[arg(long)]
    countdown: Option<u64>,

    /// Skip scanning songs and building the index at startup.
    #[arg(long)]
    skip_scan_songs: bool,

    /// Require this password before accessing the control surface.
    #[arg(long, env = "PARTYMIC_CONTROL_PASSWORD")]
    control_password: Option<String>,

    /// Disable microphone/ingress features; expose the control surface
    /// only.
    #[arg(long)]
    control_only: bool,

    /// Maximum characters allowed for player display names.
    #[arg(long)]
    max_name_length: Option<usize>,

    /// Initialize the game config's [Record] section for the virtual
    /// sinks, then continue startup.
    #[arg(long)]
    set_inputs: bool,

    /// Data directory for persistent state (capacity store, song index).
    #[arg(short = 'd', long, env = "PARTYMIC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path to the audio-ingress child binary.
    #[arg(long)]
    ingress_binary: Option<PathBuf>,

    /// Command launched to display the fullscreen countdown overlay.
    #[arg(long)]
    overlay_command: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Partymic Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(usdx_dir) = args.usdx_dir {
        config.usdx_dir = usdx_dir;
    }
    if let Some(playlist_name) = args.playlist_name {
        config.playlist_name = playlist_name;
    }
    if let Some(audio_format) = args.audio_format {
        config.audio_format = audio_format;
    }
    if let Some(log_file) = args.usdx_log_file {
        config.usdx_log_file = Some(log_file);
    }
    if let Some(countdown) = args.countdown {
        config.countdown = countdown;
    }
    if args.skip_scan_songs {
        config.skip_scan_songs = true;
    }
    if let Some(password) = args.control_password {
        config.control_password = Some(password);
    }
    if args.control_only {
        config.control_only = true;
    }
    if let Some(max_name_length) = args.max_name_length {
        config.max_name_length = max_name_length;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(ingress_binary) = args.ingress_binary {
        config.ingress_binary = ingress_binary;
    }
    if let Some(overlay_command) = args.overlay_command {
        config.overlay_command = Some(overlay_command);
    }

    log::info!(
        "Configuration: port={}, usdx_dir={}, control_only={}",
        config.port,
        config.usdx_dir.display(),
        config.control_only
    );

    let port = config.port;
    let set_inputs = args.set_inputs;
    let services = bootstrap_services(config.to_core_config())
        .await
        .context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    // Point the game's recording devices at the virtual sinks before it
    // starts. A missing config file here is a deployment error.
    if set_inputs {
        if services.config.control_only {
            log::info!("Skipping --set-inputs in control-only mode");
        } else {
            services
                .game_config
                .initialize_record_section(sink_name)
                .context("Failed to initialize [Record] section (--set-inputs)")?;
        }
    }

    services.start_background_tasks();
    log::info!("Background tasks started");

    let app_state = services.app_state();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, port).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("HTTP server started on port {}", port);

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
