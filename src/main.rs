#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use tracing::{error, info};
use tsdx::observability::init_tracing;
use tsdx::{DataServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };
    init_tracing(&config.log).map_err(|e| e as Box<dyn std::error::Error>)?;

    if config.sources.is_empty() {
        info!("No sources configured; menu will be empty");
    }

    let server = DataServer::from_config(&config).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received ctrl-c");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
        }
    });

    server.run().await;
    Ok(())
}
