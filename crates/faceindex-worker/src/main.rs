use anyhow::Result;
use faceindex_worker::{protocol, spawn_worker, Config, OrtLoader};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries protocol replies; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        queue_depth = config.queue_depth,
        "faceindex-worker starting"
    );

    let handle = spawn_worker(OrtLoader::default(), config.runtime, config.queue_depth)?;
    protocol::serve(handle, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;

    tracing::info!("faceindex-worker shutting down");
    Ok(())
}
