use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use camera_grid::{
    chain::ChainAssembler,
    config::Config,
    display::{presenter_for, StaticDisplay},
    engine::{availability_report, gst_engine::GstEngine},
    service,
    session::SessionEventKind,
    Supervisor,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "camera-grid.toml", env = "CAMERA_GRID_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Check which decoders and video sinks are available and exit
    #[arg(long)]
    check_plugins: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::from_file(&args.config).await {
        Ok(config) => Some(config),
        Err(e) if args.check_plugins => {
            eprintln!("{}", e);
            None
        }
        Err(e) => return Err(e.into()),
    };

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        let level = config
            .as_ref()
            .map(|c| c.app.log_level.clone())
            .unwrap_or_else(|| "info".to_string());
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();

    info!("Starting Camera Grid v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    let engine = GstEngine::initialize()?;

    if args.check_plugins {
        let config = config.unwrap_or_default();
        let assembler = ChainAssembler::from_config(&config.decode);
        let presenter = presenter_for(config.display.backend);

        println!("\nCamera Grid Plugin Report");
        println!("=========================");
        println!("\nGStreamer Version: {}", GstEngine::version_string());
        println!("Display backend: {}", config.display.backend);
        let mut role = String::new();
        for entry in availability_report(&engine, &assembler, presenter.as_ref()) {
            if entry.role != role {
                println!("\n{}:", entry.role);
                role = entry.role.clone();
            }
            let status = if entry.available { "✓" } else { "✗" };
            println!("  {} {}", status, entry.factory);
        }
        return Ok(());
    }

    let Some(config) = config else {
        return Ok(());
    };
    let config = Arc::new(config);
    info!(
        "Loaded {} streams, {} display, {}x{}",
        config.streams.len(),
        config.display.backend,
        config.display.width,
        config.display.height
    );

    let display = StaticDisplay::new(config.display.window_handles.clone());
    let mut supervisor = Supervisor::new(&config, Arc::new(engine), Arc::new(display))?;

    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Event log fell behind, skipped {} events", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event.kind {
                SessionEventKind::Fault(fault) => {
                    warn!("Stream {} faulted: {}", event.stream, fault)
                }
                SessionEventKind::DecoderSelected { codec, decoder } => {
                    info!("Stream {} decodes {} with {}", event.stream, codec, decoder)
                }
                other => debug!("Stream {}: {:?}", event.stream, other),
            }
        }
    });

    let report = supervisor
        .run_until(async {
            match service::wait_for_shutdown().await {
                Ok(signal) => info!("Received {}, shutting down", signal),
                Err(e) => error!("Failed to listen for shutdown signals: {}", e),
            }
        })
        .await?;

    for stream in &report.streams {
        info!(
            "Stream {} finished {} after {} connects, {} playing cycles",
            stream.stream, stream.phase, stream.connect_attempts, stream.playing_cycles
        );
    }
    if report.timed_out {
        warn!(
            "Shutdown took {:?}, longer than the configured {}s",
            report.elapsed, config.app.shutdown_timeout_seconds
        );
    }

    info!("Camera Grid stopped");
    Ok(())
}
