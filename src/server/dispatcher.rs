use crate::downsample::{reduce, DownsampleError, DownsampleSpec, RowGuard};
use crate::matrix::DataMatrix;
use crate::observability::fetch_span;
use crate::protocol::response::{error_line, version_line};
use crate::protocol::{
    serialize, BinaryPayload, Command, ProtocolError, Request, RequestParams, RequestResult,
};
use crate::source::{DataSource, SourceData, SourceError, SourceRegistry, Window};
use bytes::BytesMut;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Protocol version reported by `version`.
pub const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Downsample(#[from] DownsampleError),
}

/// What a command produced, before framing.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `version` answers with a bare line rather than a counted response.
    Version(String),
    Result(RequestResult),
}

impl Reply {
    pub fn into_bytes(self) -> BytesMut {
        match self {
            Reply::Version(v) => version_line(&v),
            Reply::Result(result) => serialize(&result),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Result(r) if r.is_error())
    }
}

/// Routes parsed requests to handlers. `dispatch` blocks while a source
/// fetches; callers run it on the blocking pool.
pub struct Dispatcher {
    registry: Arc<SourceRegistry>,
    max_rows: usize,
}

impl Dispatcher {
    pub fn new(registry: Arc<SourceRegistry>, max_rows: usize) -> Self {
        Dispatcher { registry, max_rows }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn dispatch(&self, request: &Request) -> Reply {
        let command = match request.command.parse::<Command>() {
            Ok(command) => command,
            Err(e) => return Reply::Result(RequestResult::error(e.to_string())),
        };
        match command {
            Command::Version => Reply::Version(PROTOCOL_VERSION.to_string()),
            Command::Menu => Reply::Result(self.menu()),
            Command::GetData => Reply::Result(self.get_data(&request.params).unwrap_or_else(|e| {
                warn!(error = %e, "getdata failed");
                RequestResult::error(e.to_string())
            })),
        }
    }

    fn menu(&self) -> RequestResult {
        RequestResult::text(self.registry.menu().iter().map(|s| s.to_line()).collect())
    }

    fn get_data(&self, params: &RequestParams) -> Result<RequestResult, DispatchError> {
        let name = params.require("source")?;
        let source = self.registry.resolve(name)?;
        let window = Window::from_params(params)?;
        let spec = DownsampleSpec::from_params(params)?;
        let guard = RowGuard::new(self.max_rows, name);

        if let Some(rows) = source.count_rows(params, &window) {
            guard.check_estimate(rows, spec)?;
        }

        let data = {
            let _span = fetch_span(name).entered();
            source.get_data(params, &window)?
        };

        let result = match data {
            SourceData::Lines(lines) => RequestResult::text(lines),
            SourceData::Matrix(matrix) => {
                let reduced = reduce(matrix, spec, &guard, window.start)?;
                debug!(source = %name, rows = reduced.rows(), "Serving matrix");
                RequestResult::binary(
                    source.kind(),
                    BinaryPayload::single(reduced, source.layout()),
                )
            }
            SourceData::Bundle(blocks) => bundle_result(source.as_ref(), blocks, spec, &guard, window)?,
        };
        Ok(result)
    }
}

/// Downsample the primary block of a bundle; secondary blocks pass through.
fn bundle_result(
    source: &dyn DataSource,
    blocks: Vec<DataMatrix>,
    spec: DownsampleSpec,
    guard: &RowGuard<'_>,
    window: Window,
) -> Result<RequestResult, DispatchError> {
    let mut blocks = blocks.into_iter();
    let primary = blocks
        .next()
        .ok_or_else(|| SourceError::Adapter("source returned an empty bundle".to_string()))?;
    let mut reduced = vec![reduce(primary, spec, guard, window.start)?];
    reduced.extend(blocks);
    Ok(RequestResult::binary(source.kind(), BinaryPayload::bundle(reduced)))
}

/// Encoded error response for a line that never became a request.
pub fn reject(error: &ProtocolError) -> BytesMut {
    error_line(&error.to_string())
}
