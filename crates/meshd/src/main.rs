//! Mesh registry daemon
//!
//! Binds the registry listener and drives one handler task per control
//! connection. SIGINT/SIGTERM stop the accept loop and let the process
//! exit; registry state is soft, so clients re-register on the next start.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures::{FutureExt, pin_mut};
use mesh_registry::{RegistryConfig, RegistryServer};
use mesh_runtime::SmolSpawner;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshd")]
#[command(about = "Service-mesh registry daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address; overrides the configuration file
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })?;

    smol::block_on(async move {
        let mut config = match &cli.config {
            Some(path) => RegistryConfig::from_file(path).await?,
            None => RegistryConfig::default(),
        };
        if let Some(listen) = cli.listen {
            config.listen_addr = listen;
        }

        let server = RegistryServer::bind(&config.listen_addr, Arc::new(SmolSpawner)).await?;
        info!("meshd serving on {}", server.local_addr()?);

        let shutdown = shutdown_rx.recv().fuse();
        pin_mut!(shutdown);

        loop {
            let accept = server.accept().fuse();
            pin_mut!(accept);

            futures::select! {
                result = accept => match result {
                    Ok(handler) => {
                        smol::spawn(handler.handle()).detach();
                    }
                    Err(err) => {
                        error!("accept failed: {}", err);
                    }
                },
                _ = shutdown => {
                    info!("shutdown signal received, stopping");
                    break;
                }
            }
        }

        Ok(())
    })
}
