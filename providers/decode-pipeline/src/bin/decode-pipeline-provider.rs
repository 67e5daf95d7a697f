//! # Decode Pipeline Provider Binary
//!
//! Connects to Postgres, Redis and NATS and serves pipeline jobs.

use anyhow::{Context, Result};
use tracing::info;

use decode_pipeline_provider::DecodePipelineProvider;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("decode_pipeline_provider=info".parse()?)
                .add_directive("abi_decoder_provider=info".parse()?),
        )
        .init();

    info!("Starting Decode Pipeline Provider");

    let provider = DecodePipelineProvider::new()
        .await
        .context("Failed to create Decode Pipeline provider")?;

    info!("Provider ready - waiting for jobs");

    provider.run().await.context("Provider runtime error")?;

    info!("Decode Pipeline Provider shutdown complete");
    Ok(())
}
