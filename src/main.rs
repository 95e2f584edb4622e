use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stagebox::arbiter::ModeArbiter;
use stagebox::config::ConfigStore;
use stagebox::events::EventBus;
use stagebox::ingest::IngestSet;
use stagebox::mixer::{MixerEngine, SceneStore};
use stagebox::pipeline::runtime;
use stagebox::platform::PlatformProbe;
use stagebox::recording::RecordingSupervisor;
use stagebox::registry::RegistryClient;
use stagebox::state::AppState;
use stagebox::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// stagebox command line arguments
#[derive(Parser, Debug)]
#[command(name = "stagebox")]
#[command(version, about = "On-device multi-camera capture, mixing and recording server", long_about = None)]
struct CliArgs {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", default_value = "stagebox.yaml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting stagebox v{}", env!("CARGO_PKG_VERSION"));
    runtime::ensure_gst_init();

    // Configuration
    let config = Arc::new(ConfigStore::load(&args.config)?);
    {
        let mut cfg = (*config.get()).clone();
        if let Some(addr) = args.address {
            cfg.web.bind_address = addr;
        }
        if let Some(port) = args.port {
            cfg.web.port = port;
        }
        config.set(cfg);
    }
    let cfg = config.get();
    tracing::info!(
        cameras = cfg.cameras.len(),
        config = %args.config.display(),
        "Configuration loaded"
    );

    // Shared infrastructure
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let events = Arc::new(EventBus::new());
    let probe = Arc::new(PlatformProbe::detect());
    let registry = Arc::new(RegistryClient::new(&cfg.stream_server));

    // Scenes
    let scenes = Arc::new(SceneStore::new(&cfg.mixer.scenes_path));
    if let Err(e) = scenes.load_all() {
        tracing::warn!("Scene loading failed: {}", e);
    }

    // Supervisors and the arbiter that owns them
    let ingest = IngestSet::new(
        cfg.ingest.clone(),
        probe.clone(),
        registry.clone(),
        events.clone(),
    );
    let recording = RecordingSupervisor::new(
        config.clone(),
        ingest.clone(),
        registry.clone(),
        events.clone(),
    );
    let mixer = MixerEngine::new(
        config.clone(),
        scenes.clone(),
        probe.clone(),
        registry.clone(),
        events.clone(),
    );
    let arbiter = ModeArbiter::new(config.clone(), ingest, recording, mixer, events.clone());

    // Boot the persisted (or default) mode; a failure leaves the arbiter
    // degraded but the control surface up, so an operator can switch
    if let Err(e) = arbiter.startup().await {
        tracing::error!("Boot mode did not start cleanly: {}", e);
    }

    let state = AppState::new(
        config.clone(),
        arbiter.clone(),
        registry,
        scenes,
        probe,
        events,
        shutdown_tx.clone(),
    );

    // HTTP control surface
    let app = web::create_router(state.clone());
    let addr: SocketAddr = format!("{}:{}", cfg.web.bind_address, cfg.web.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Control surface listening on http://{}", addr);

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_on_signal(shutdown_tx.clone()));
    if let Err(e) = server.await {
        tracing::error!("Server error: {}", e);
    }

    // Release encoders and capture devices before exiting
    arbiter.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives, after fanning out the
/// internal shutdown broadcast
async fn shutdown_on_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
    let _ = shutdown_tx.send(());
}

fn init_logging(log_level: LogLevel, verbose: u8) {
    let level = match (log_level, verbose) {
        (_, 2..) => "trace",
        (_, 1) => "debug",
        (LogLevel::Error, _) => "error",
        (LogLevel::Warn, _) => "warn",
        (LogLevel::Info, _) => "info",
        (LogLevel::Debug, _) => "debug",
        (LogLevel::Trace, _) => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("stagebox={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
