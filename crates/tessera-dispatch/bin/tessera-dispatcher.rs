//! Dispatcher binary entry point.
//!
//! Thin wrapper around the tessera-dispatch library that:
//! 1. Initializes logging
//! 2. Parses and validates configuration
//! 3. Recovers the controlled files and serves until `TERMINATE`

use anyhow::Result;
use tessera_dispatch::{DispatchServer, DispatcherConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("tessera dispatcher {} starting", tessera_dispatch::VERSION);

    let config = DispatcherConfig::from_args();
    tracing::info!(
        "Configuration loaded: db_dir={:?}, shared_name={}, controlled={:?}",
        config.db_dir,
        config.shared_name,
        config.controlled_files
    );

    let server = DispatchServer::bind(config)?;
    server.run().await?;

    Ok(())
}
