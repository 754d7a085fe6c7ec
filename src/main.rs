//! Framegate: synthetic camera → single-slot pipeline → display sink

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use framegate::capture::SyntheticCamera;
use framegate::{Config, Pipeline, ProcessingEnvironment};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framegate=debug"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());

    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

/// Re-read the configuration on SIGHUP. Only settings read live, such as
/// the blur sigma, take effect without a restart.
#[cfg(unix)]
async fn reload_on_hangup(path: Option<PathBuf>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    while hangup.recv().await.is_some() {
        match Config::load(path.as_deref()) {
            Ok(config) => {
                info!("Configuration reloaded");
                framegate::CONFIG.store(Arc::new(config));
            }
            Err(e) => error!("Keeping previous configuration: {}", e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Framegate launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    framegate::CONFIG.store(Arc::new(config.clone()));

    let environment = ProcessingEnvironment::start(&config.transform, &config.pipeline)?;
    let pipeline = Pipeline::spawn(config.pipeline.clone(), environment.transform())?;

    // Camera task: one delivery per frame period, never waits on processing
    let adapter = pipeline.adapter();
    let mut camera = SyntheticCamera::new(config.capture.clone());
    let frame_period = Duration::from_secs_f64(1.0 / config.capture.fps as f64);
    let capture_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frame_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            adapter.deliver(camera.next_frame());
            if camera.outstanding() != 0 {
                error!("{} camera frames not released", camera.outstanding());
            }
        }
    });

    // Stand-in for the UI: read the sink periodically
    let sink = pipeline.sink().clone();
    let gate = pipeline.gate().clone();
    let stats_interval = Duration::from_millis(config.display.stats_interval_ms.max(1));
    let stats_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stats_interval);
        loop {
            ticker.tick().await;
            let latency = sink.latency_stats();
            let counts = gate.stats();
            let shown = sink
                .current_image()
                .map(|image| format!("#{} {}x{}", image.sequence(), image.width(), image.height()))
                .unwrap_or_else(|| "none".into());
            info!(
                "showing {} | latency {} ms (avg {:.1}, p99 {:.1}, n={}) | accepted {} dropped {} failed {}",
                shown,
                sink.current_latency_ms(),
                latency.avg_ms,
                latency.p99_ms,
                latency.count,
                counts.accepted,
                counts.dropped,
                counts.failed
            );
        }
    });

    #[cfg(unix)]
    let reload_handle = tokio::spawn(reload_on_hangup(config_path.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");

    capture_handle.abort();
    stats_handle.abort();
    #[cfg(unix)]
    reload_handle.abort();

    let metrics = pipeline.metrics();
    let last_image = pipeline.sink().current_image();
    pipeline.shutdown().await;
    info!("Final metrics: {:?}", metrics);

    if let (Some(path), Some(image)) = (&config.display.snapshot_path, last_image) {
        if let Err(e) = image.save(path) {
            error!("Failed to save snapshot: {}", e);
        }
    }

    info!("Framegate shutting down");
    Ok(())
}
