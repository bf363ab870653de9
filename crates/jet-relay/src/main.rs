//! jet-relay: JET relay server binary

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use jet_relay::{Cli, RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli)?;

    let _log_guard = jet_relay::logging::init(config.log_file.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting jet-relay");

    let server = RelayServer::new(config)?;
    if let Err(e) = server.run().await {
        error!(error = %e, "Relay server failed");
        return Err(e);
    }

    Ok(())
}
