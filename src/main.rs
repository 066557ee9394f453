//! Vigil multi-stream face recognition pipeline

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vigil::display::{FrameSink, HeadlessSink, Overlay, SnapshotSink};
use vigil::pipeline::ShutdownSummary;
use vigil::utils::SchemeRouter;
use vigil::vision::{Capabilities, IdentityMap};
use vigil::{Config, DisplayBackend, Orchestrator, StreamResources};

#[derive(Debug, Parser)]
#[command(version, about = "Face recognition across many live video streams")]
struct Args {
    /// TOML configuration file (default: ./vigil.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured display backend
    #[arg(short, long, value_enum)]
    display: Option<DisplayBackend>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime());

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        fmt.finish()
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling"))]
    fmt.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();
    let args = Args::parse();

    info!("Vigil launching...");

    let mut config = Config::load(args.config.as_deref()).wrap_err("failed to load configuration")?;
    if let Some(backend) = args.display {
        config.display.backend = backend;
    }
    if config.streams.is_empty() {
        warn!("no streams configured");
    }

    let identities = Arc::new(
        IdentityMap::load(&config.recognition.identity_map).wrap_err("failed to load identity map")?,
    );
    info!(identities = identities.len(), "identity map loaded");
    let capabilities = Arc::new(Capabilities::load(&config, identities)?);
    let overlay = Arc::new(Overlay::load(
        config.display.font.as_deref(),
        config.display.font_size,
    )?);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
        }
        ctrl_c.cancel();
    });

    let resources = |sink: Arc<dyn FrameSink>| StreamResources {
        connector: Arc::new(SchemeRouter::new(&config.pipeline)),
        capabilities: capabilities.clone(),
        overlay: overlay.clone(),
        sink,
        events: None,
    };

    let summary = match config.display.backend {
        DisplayBackend::Headless => {
            run(&config, resources(Arc::new(HeadlessSink)), shutdown).await
        }
        DisplayBackend::Snapshot => {
            let sink = SnapshotSink::new(&config.display.snapshot_dir, config.display.snapshot_every)?;
            info!(dir = %config.display.snapshot_dir.display(), "writing snapshots");
            run(&config, resources(Arc::new(sink)), shutdown).await
        }
        DisplayBackend::Sdl => run_sdl(&config, resources, shutdown).await?,
    };

    info!(
        streams = summary.streams.len(),
        failed = summary.failed(),
        "Vigil shutting down"
    );
    Ok(())
}

async fn run(config: &Config, resources: StreamResources, shutdown: CancellationToken) -> ShutdownSummary {
    let mut orchestrator = Orchestrator::new(&config.streams, &config.pipeline, resources, shutdown);
    orchestrator.start_all();
    orchestrator.run().await
}

#[cfg(feature = "sdl-display")]
async fn run_sdl(
    config: &Config,
    resources: impl FnOnce(Arc<dyn FrameSink>) -> StreamResources,
    shutdown: CancellationToken,
) -> Result<ShutdownSummary> {
    use color_eyre::eyre::eyre;
    use vigil::display::{ChannelSink, Sdl2Display};

    let (sink, rx) = ChannelSink::new(config.display.queue_depth);
    let mut orchestrator = Orchestrator::new(
        &config.streams,
        &config.pipeline,
        resources(Arc::new(sink)),
        shutdown.clone(),
    );
    orchestrator.start_all();
    let done = shutdown.clone();
    let pipeline = tokio::spawn(async move {
        let summary = orchestrator.run().await;
        // Let the display loop exit once every stream is done.
        done.cancel();
        summary
    });

    // SDL stays on this thread for the lifetime of the windows.
    tokio::task::block_in_place(|| -> Result<()> {
        let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
        let mut display = Sdl2Display::new(&sdl_context)?;
        display.run(&sdl_context, rx, &shutdown)
    })?;
    shutdown.cancel();

    Ok(pipeline.await?)
}

#[cfg(not(feature = "sdl-display"))]
async fn run_sdl(
    config: &Config,
    resources: impl FnOnce(Arc<dyn FrameSink>) -> StreamResources,
    shutdown: CancellationToken,
) -> Result<ShutdownSummary> {
    warn!("built without the `sdl-display` feature, running headless");
    Ok(run(config, resources(Arc::new(HeadlessSink)), shutdown).await)
}
