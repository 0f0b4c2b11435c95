use clap::Parser as _;
use rillflow_main::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Install stdio tracing logger.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    Cli::parse().execute().await?;
    Ok(())
}
