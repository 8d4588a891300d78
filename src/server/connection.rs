use super::dispatcher::{reject, Dispatcher};
use crate::observability::{connection_span, request_span};
use crate::protocol::response::error_line;
use crate::protocol::{parse_request, ProtocolError, RequestFrame, RequestLineCodec};
use bytes::BytesMut;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// State shared by every connection of one server.
pub struct Shared {
    pub dispatcher: Arc<Dispatcher>,
    /// Bounds requests processed at once across all connections.
    pub handlers: Arc<Semaphore>,
    pub idle_timeout: Duration,
    pub shutdown: CancellationToken,
}

/// Serves one client: reads a request line, answers it completely, then
/// reads the next. Requests on a connection never overlap.
pub struct ConnectionHandler {
    stream: TcpStream,
    shared: Arc<Shared>,
    client_addr: String,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, shared: Arc<Shared>, client_addr: String) -> Self {
        ConnectionHandler {
            stream,
            shared,
            client_addr,
        }
    }

    pub async fn run(self) {
        let span = connection_span(&self.client_addr);
        self.serve().instrument(span).await
    }

    async fn serve(self) {
        info!("Client connected");
        let shared = self.shared;
        let (read_half, mut write_half) = self.stream.into_split();
        let mut frames = FramedRead::new(read_half, RequestLineCodec::new());

        loop {
            let next = tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    debug!("Closing connection for shutdown");
                    break;
                }
                next = tokio::time::timeout(shared.idle_timeout, frames.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    info!(timeout_secs = shared.idle_timeout.as_secs(), "Closing idle connection");
                    break;
                }
                Ok(None) => {
                    info!("Client disconnected");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Error reading from client");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let response = match frame {
                RequestFrame::Oversized(len) => {
                    warn!(bytes = len, "Dropped oversized request line");
                    reject(&ProtocolError::LineTooLong(len))
                }
                RequestFrame::Line(line) => match handle_line(&shared, line).await {
                    Some(response) => response,
                    None => break,
                },
            };

            // One buffer per response: a declared byte count is never sent short.
            if let Err(e) = write_half.write_all(&response).await {
                error!(error = %e, "Failed to write response");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    }
}

/// Parse, dispatch and serialize one request. `None` means shutdown was
/// requested before a response existed; the connection closes unanswered.
async fn handle_line(shared: &Shared, line: String) -> Option<BytesMut> {
    let request = match parse_request(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Invalid request");
            return Some(reject(&e));
        }
    };

    let span = request_span(&request.command);
    let permit = tokio::select! {
        _ = shared.shutdown.cancelled() => return None,
        permit = Arc::clone(&shared.handlers).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Some(error_line("server shutting down")),
        },
    };

    let dispatcher = Arc::clone(&shared.dispatcher);
    let started = Instant::now();
    let fetch_span = span.clone();
    let task = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let _entered = fetch_span.entered();
        let reply = dispatcher.dispatch(&request);
        let failed = reply.is_error();
        (reply.into_bytes(), failed)
    });

    let joined = tokio::select! {
        _ = shared.shutdown.cancelled() => return None,
        joined = task => joined,
    };

    let _entered = span.enter();
    match joined {
        Ok((response, failed)) => {
            debug!(
                bytes = response.len(),
                failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request served"
            );
            Some(response)
        }
        Err(e) => {
            error!(error = %e, "Request handler panicked");
            Some(error_line("internal error"))
        }
    }
}
