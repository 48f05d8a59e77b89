//! gossamerd - replicated CRDT key-value store agent.

use gossamerd::{Config, Hub};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load config");
        e
    })?;

    let _hub = Hub::serve(config).await?;

    // The accept loop and gossip tasks run until the process is killed.
    std::future::pending::<()>().await;
    Ok(())
}
