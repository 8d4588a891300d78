//! TCP Server
//!
//! One task per connection. Two semaphores bound the work: `max_connections`
//! caps open sockets (excess sockets get `error: too many connections` and
//! are closed, never queued) and `handlers` caps requests processed at once.
//! Shutdown is driven by a [`CancellationToken`].

pub mod connection;
pub mod dispatcher;

pub use connection::{ConnectionHandler, Shared};
pub use dispatcher::{DispatchError, Dispatcher, Reply, PROTOCOL_VERSION};

use crate::config::ServerConfig;
use crate::protocol::response::error_line;
use crate::source::{SourceError, SourceRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long shutdown waits for open connections to finish.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const TOO_MANY_CONNECTIONS: &str = "too many connections";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Source(#[from] SourceError),
}

pub struct DataServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    connections: Arc<Semaphore>,
    max_connections: usize,
}

impl DataServer {
    pub async fn bind(config: &ServerConfig, registry: Arc<SourceRegistry>) -> Result<Self, ServerError> {
        let bind_error = |source: std::io::Error| ServerError::Bind {
            addr: config.listen_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&config.listen_addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let shared = Shared {
            dispatcher: Arc::new(Dispatcher::new(registry, config.max_rows)),
            handlers: Arc::new(Semaphore::new(config.handlers)),
            idle_timeout: config.idle_timeout(),
            shutdown: CancellationToken::new(),
        };

        Ok(DataServer {
            listener,
            local_addr,
            shared: Arc::new(shared),
            connections: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    /// Bind with the sources named in the config.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let registry = SourceRegistry::from_config(&config.sources)?;
        Self::bind(config, Arc::new(registry)).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancelling this token stops the accept loop and closes connections
    /// between requests.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    pub async fn run(self) {
        info!(
            addr = %self.local_addr,
            sources = self.shared.dispatcher.registry().len(),
            max_connections = self.max_connections,
            "Server listening"
        );

        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            match Arc::clone(&self.connections).try_acquire_owned() {
                Ok(permit) => {
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        ConnectionHandler::new(stream, shared, addr.to_string()).run().await;
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!(client = %addr, limit = self.max_connections, "Refusing connection");
                    tokio::spawn(refuse(stream));
                }
            }
        }

        info!("Shutting down, waiting for open connections");
        let all = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        if tokio::time::timeout(SHUTDOWN_GRACE, self.connections.acquire_many(all))
            .await
            .is_err()
        {
            warn!("Connections still open after grace period");
        }
        info!("Server stopped");
    }
}

async fn refuse(mut stream: TcpStream) {
    let _ = stream.write_all(&error_line(TOO_MANY_CONNECTIONS)).await;
    let _ = stream.shutdown().await;
}
