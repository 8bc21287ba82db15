use control_plane::ControlPlaneBuilder;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("starting runnerpool control plane...");

    let mut builder = ControlPlaneBuilder::new();
    if let Some(min) = env_usize("RUNNERPOOL_MIN_SIZE") {
        builder = builder.min_size(min);
    }
    if let Some(max) = env_usize("RUNNERPOOL_MAX_SIZE") {
        builder = builder.max_size(max);
    }
    if let Some(warmup) = env_usize("RUNNERPOOL_WARMUP") {
        builder = builder.warmup_containers(warmup);
    }
    if let Ok(image) = env::var("RUNNERPOOL_BASE_IMAGE") {
        builder = builder.base_image(image);
    }
    if let Ok(url) = env::var("RUNNERPOOL_REDIS_URL") {
        builder = builder.redis_url(url);
    }
    if let Some(secs) = env_usize("RUNNERPOOL_SCALE_INTERVAL_SECS") {
        builder = builder.scale_interval(Duration::from_secs(secs as u64));
    }
    if let Ok(value) = env::var("RUNNERPOOL_PERSISTENCE") {
        builder = builder.persistence_enabled(value != "0" && value != "false");
    }

    let coordinator = match builder.build() {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("failed to build control plane: {e}");
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    if let Err(e) = coordinator.start().await {
        error!("failed to start control plane: {e}");
        return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
    }

    info!("control plane running; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received");
    coordinator.stop().await;
    Ok(())
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
