//! Client
//!
//! [`DataClient`] sends one request at a time over a single TCP connection
//! and reads the complete response before returning. Every logical request
//! goes through [`retry_async`]; a failed attempt drops the connection and
//! the fixup step reopens it, so one bad attempt never leaks into the next.

pub mod retry;

pub use retry::{retry_async, RetryPolicy};

use crate::config::ClientConfig;
use crate::matrix::codec::CodecError;
use crate::matrix::merge::{MergeError, SeriesAssembler};
use crate::matrix::DataMatrix;
use crate::observability::client_request_span;
use crate::protocol::response::{decode_binary, VERSION_PREFIX};
use crate::protocol::{
    parse_status_line, Command, ProtocolError, Request, RequestParams, Response, ResponseHeader,
    SourceInfo, StatusLine,
};
use crate::server::dispatcher::PROTOCOL_VERSION;
use crate::source::{SourceError, Window};
use futures::FutureExt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, Instrument};

/// Largest binary body the client will allocate for.
pub const MAX_BODY_BYTES: usize = 1 << 30;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?} waiting for the server")]
    Timeout(Duration),

    #[error("connection closed by server")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Window(#[from] SourceError),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected response: {0}")]
    Unexpected(String),

    #[error("no answer from {addr} after {attempts} attempts")]
    Unavailable { addr: String, attempts: u32 },
}

/// How the first response line is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    VersionLine,
    Counted,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// The socket plus what is needed to reopen it.
pub struct Transport {
    addr: String,
    read_timeout: Duration,
    conn: Option<Connection>,
}

impl Transport {
    pub fn new(addr: impl Into<String>, read_timeout: Duration) -> Self {
        Transport {
            addr: addr.into(),
            read_timeout,
            conn: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let stream = tokio::time::timeout(self.read_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ClientError::Timeout(self.read_timeout))??;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        self.conn = Some(Connection {
            reader: BufReader::new(read_half),
            writer,
        });
        debug!(addr = %self.addr, "Connected");
        Ok(())
    }

    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!(addr = %self.addr, "Connection closed");
        }
    }

    /// Drop the current socket and try to open a fresh one. A failed
    /// reconnect is left for the next attempt to report.
    pub async fn reset(&mut self) {
        self.close();
        if let Err(e) = self.connect().await {
            debug!(addr = %self.addr, error = %e, "Reconnect failed");
        }
    }

    /// Send one request line and read its whole response. Any failure
    /// closes the connection, since its read position is unknown.
    async fn exchange(&mut self, line: &str, framing: Framing) -> Result<Response, ClientError> {
        let result = self.exchange_inner(line, framing).await;
        if result.is_err() {
            self.close();
        }
        result
    }

    async fn exchange_inner(&mut self, line: &str, framing: Framing) -> Result<Response, ClientError> {
        if self.conn.is_none() {
            self.connect().await?;
        }
        let timeout = self.read_timeout;
        let conn = self.conn.as_mut().ok_or(ClientError::Closed)?;
        conn.writer.write_all(line.as_bytes()).await?;

        let status = read_line(&mut conn.reader, timeout).await?;
        if framing == Framing::VersionLine {
            if let Some(version) = status.strip_prefix(VERSION_PREFIX) {
                return Ok(Response::Text {
                    header: ResponseHeader::new(),
                    lines: vec![version.to_string()],
                });
            }
        }

        let header = match parse_status_line(&status)? {
            StatusLine::Error(message) if message == crate::server::TOO_MANY_CONNECTIONS => {
                return Err(ClientError::Server(message));
            }
            StatusLine::Error(message) => return Ok(Response::Error(message)),
            StatusLine::Ok(header) => header,
        };

        if let Some(bytes) = header.byte_count()? {
            if bytes > MAX_BODY_BYTES {
                return Err(ProtocolError::MalformedHeader(status).into());
            }
            let mut body = vec![0u8; bytes];
            tokio::time::timeout(timeout, conn.reader.read_exact(&mut body))
                .await
                .map_err(|_| ClientError::Timeout(timeout))??;
            let blocks = decode_binary(&body, header.layout()?)?;
            return Ok(Response::Binary { header, blocks });
        }

        let count = header
            .line_count()?
            .ok_or_else(|| ProtocolError::MalformedHeader(status.clone()))?;
        let mut lines = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            lines.push(read_line(&mut conn.reader, timeout).await?);
        }
        Ok(Response::Text { header, lines })
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>, timeout: Duration) -> Result<String, ClientError> {
    let mut line = String::new();
    let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| ClientError::Timeout(timeout))??;
    if read == 0 {
        return Err(ClientError::Closed);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Synchronous-per-call client with reconnecting retries.
pub struct DataClient {
    transport: Transport,
    retry: RetryPolicy,
}

impl DataClient {
    /// Build a client. The connection opens lazily on the first request.
    pub fn new(config: &ClientConfig) -> Self {
        let mut retry = RetryPolicy::new(config.max_attempts);
        if let Some(backoff) = config.backoff() {
            retry = retry.with_backoff(backoff);
        }
        DataClient {
            transport: Transport::new(config.addr.clone(), config.read_timeout()),
            retry,
        }
    }

    /// Build a client and open its connection now.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let mut client = Self::new(config);
        client.transport.connect().await?;
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        self.transport.addr()
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    async fn call(&mut self, request: Request, framing: Framing) -> Result<Response, ClientError> {
        let line = request.encode()?;
        let span = client_request_span(&request.command, self.transport.addr());
        let answer = retry_async(
            &mut self.transport,
            &self.retry,
            |transport| {
                let line = line.clone();
                async move { transport.exchange(&line, framing).await }.boxed()
            },
            |transport| async move { transport.reset().await }.boxed(),
        )
        .instrument(span)
        .await;
        answer.ok_or_else(|| ClientError::Unavailable {
            addr: self.transport.addr().to_string(),
            attempts: self.retry.max_attempts,
        })
    }

    /// Server protocol version.
    pub async fn version(&mut self) -> Result<String, ClientError> {
        let request = Request::new(Command::Version, RequestParams::new());
        match self.call(request, Framing::VersionLine).await? {
            Response::Text { mut lines, .. } if lines.len() == 1 => Ok(lines.remove(0)),
            Response::Error(message) => Err(ClientError::Server(message)),
            other => Err(ClientError::Unexpected(format!("{:?}", other))),
        }
    }

    /// True if the server speaks the protocol version this client was built for.
    pub async fn is_compatible(&mut self) -> Result<bool, ClientError> {
        Ok(self.version().await? == PROTOCOL_VERSION)
    }

    /// Sources the server offers.
    pub async fn menu(&mut self) -> Result<Vec<SourceInfo>, ClientError> {
        let request = Request::new(Command::Menu, RequestParams::new());
        match self.call(request, Framing::Counted).await? {
            Response::Text { lines, .. } => lines
                .iter()
                .map(|line| SourceInfo::parse_line(line).map_err(ClientError::from))
                .collect(),
            Response::Error(message) => Err(ClientError::Server(message)),
            other => Err(ClientError::Unexpected(format!("{:?}", other))),
        }
    }

    /// Raw `getdata` response. Server-side failures come back as
    /// [`Response::Error`] rather than `Err`.
    pub async fn get_data(&mut self, params: &RequestParams) -> Result<Response, ClientError> {
        let request = Request::new(Command::GetData, params.clone());
        self.call(request, Framing::Counted).await
    }

    /// `getdata` expecting a matrix; returns the primary block.
    pub async fn get_matrix(&mut self, params: &RequestParams) -> Result<DataMatrix, ClientError> {
        match self.get_data(params).await? {
            Response::Binary { blocks, .. } => blocks
                .into_iter()
                .next()
                .ok_or_else(|| ClientError::Unexpected("empty binary response".to_string())),
            Response::Error(message) => Err(ClientError::Server(message)),
            Response::Text { lines, .. } => Err(ClientError::Unexpected(format!(
                "text response with {} lines",
                lines.len()
            ))),
        }
    }

    /// Fetch `[st, et]` in windows of `chunk_secs` and stitch the pieces
    /// into one series. Returns `None` when no window held any rows.
    pub async fn get_data_chunked(
        &mut self,
        params: &RequestParams,
        chunk_secs: f64,
    ) -> Result<Option<DataMatrix>, ClientError> {
        if chunk_secs.is_nan() || chunk_secs <= 0.0 {
            return Err(ProtocolError::InvalidParameter {
                key: "chunk".to_string(),
                value: chunk_secs.to_string(),
            }
            .into());
        }
        let window = Window::from_params(params)?;
        let mut assembler = SeriesAssembler::new();
        let mut start = window.start;
        loop {
            let end = (start + chunk_secs).min(window.end);
            if end <= start && end < window.end {
                // Chunk is below the float resolution at this time.
                return Err(ProtocolError::InvalidParameter {
                    key: "chunk".to_string(),
                    value: format!("{} at st={}", chunk_secs, start),
                }
                .into());
            }
            let chunk = params
                .clone()
                .with("st", format!("{:.3}", start))
                .with("et", format!("{:.3}", end));
            let matrix = self.get_matrix(&chunk).await?;
            debug!(st = start, et = end, rows = matrix.rows(), "Fetched chunk");
            assembler.push(matrix)?;
            if end >= window.end {
                break;
            }
            start = end;
        }
        Ok(assembler.finish())
    }
}
