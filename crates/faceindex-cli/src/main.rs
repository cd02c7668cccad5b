use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceindex_worker::{spawn_worker, Config, OrtLoader, WorkerHandle};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "faceindex", about = "On-device face indexing CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect, align and embed the faces in one image
    Index {
        /// Image file to analyze
        image: PathBuf,
        /// Identifier embedded into each face id
        #[arg(long, default_value_t = 0)]
        file_id: i64,
        /// Also compute the CLIP image embedding
        #[arg(long)]
        clip: bool,
        /// Skip face detection
        #[arg(long)]
        no_faces: bool,
    },
    /// Run a single worker operation, e.g. `prepare-runtime`
    Dispatch {
        /// Operation tag
        op: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let output = match cli.command {
        Commands::Index {
            image,
            file_id,
            clip,
            no_faces,
        } => {
            let args = json!({
                "fileId": file_id,
                "imagePath": image.to_string_lossy(),
                "runFaces": !no_faces,
                "runClip": clip,
            });
            worker(&config)?.call("detect-and-embed-image", args).await?
        }
        Commands::Dispatch { op, args } => {
            let args: Value = serde_json::from_str(&args).context("--args must be valid JSON")?;
            worker(&config)?.call(&op, args).await?
        }
        Commands::Config => serde_json::to_value(&config)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn worker(config: &Config) -> Result<WorkerHandle> {
    tracing::debug!(model_dir = %config.model_dir.display(), "starting worker");
    Ok(spawn_worker(OrtLoader::default(), config.runtime.clone(), config.queue_depth)?)
}
