//! Span helpers for the request lifecycle.

use tracing::{span, Level, Span};

/// Span covering one client connection.
#[inline]
pub fn connection_span(client_addr: &str) -> Span {
    span!(
        Level::INFO,
        "tsdx.connection",
        client.address = %client_addr,
    )
}

/// Span for one parsed request.
#[inline]
pub fn request_span(command: &str) -> Span {
    span!(Level::INFO, "tsdx.request", command = %command)
}

/// Span for a blocking source fetch.
#[inline]
pub fn fetch_span(source: &str) -> Span {
    span!(Level::DEBUG, "tsdx.fetch", source = %source)
}

/// Span for one client-side logical request, across retries.
#[inline]
pub fn client_request_span(command: &str, addr: &str) -> Span {
    span!(
        Level::DEBUG,
        "tsdx.client",
        command = %command,
        server.address = %addr,
    )
}
