//! Data Sources
//!
//! A source is a named provider of one kind of time series. The server
//! resolves the `source` parameter through a [`SourceRegistry`] and asks the
//! source for raw rows over a [`Window`]; downsampling and response framing
//! happen in the dispatcher, never inside a source.

pub mod memory;
pub mod registry;
pub mod synthetic;

pub use memory::MemorySource;
pub use registry::{SourceFactory, SourceRegistry, BUILTIN_KINDS};
pub use synthetic::SyntheticSource;

use crate::matrix::codec::Layout;
use crate::matrix::DataMatrix;
use crate::protocol::{ProtocolError, RequestParams};
use crate::time::{self, TimeError};
use thiserror::Error;

/// Span covered by a query when `st` is omitted.
pub const DEFAULT_SPAN_SECS: f64 = 86_400.0;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("unknown source kind '{0}'")]
    UnknownKind(String),

    #[error("source '{0}' registered twice")]
    DuplicateSource(String),

    #[error("source '{name}' has invalid option '{key}': {message}")]
    InvalidOption {
        name: String,
        key: String,
        message: String,
    },

    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),

    #[error("invalid window: start {start} is after end {end}")]
    InvalidWindow { start: f64, end: f64 },

    #[error("window {start}..{end} spans more than {limit} samples")]
    WindowTooLarge { start: f64, end: f64, limit: u64 },

    #[error(transparent)]
    Parameter(#[from] ProtocolError),

    #[error(transparent)]
    Time(#[from] TimeError),

    #[error("{0}")]
    Adapter(String),
}

/// Inclusive `[start, end]` query range in j2ksec.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub start: f64,
    pub end: f64,
}

impl Window {
    pub fn new(start: f64, end: f64) -> Result<Self, SourceError> {
        if start > end {
            return Err(SourceError::InvalidWindow { start, end });
        }
        Ok(Window { start, end })
    }

    /// Read `st` and `et`. `et` defaults to now and `st` to one day before
    /// `et`; relative times are taken from `et`.
    pub fn from_params(params: &RequestParams) -> Result<Self, SourceError> {
        let now = time::now_j2k();
        let end = match params.get("et") {
            Some(raw) => time::parse_time(raw, now)?,
            None => now,
        };
        let start = match params.get("st") {
            Some(raw) => time::parse_time(raw, end)?,
            None => end - DEFAULT_SPAN_SECS,
        };
        Self::new(start, end)
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Raw output of a source, before downsampling.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceData {
    Matrix(DataMatrix),
    /// Primary series first, secondary series after it.
    Bundle(Vec<DataMatrix>),
    Lines(Vec<String>),
}

/// A named provider of time-series rows.
///
/// `get_data` is a blocking call; the server runs it off the async workers.
pub trait DataSource: Send + Sync {
    /// Matrix flavor reported in the `type` header field.
    fn kind(&self) -> &str;

    fn description(&self) -> &str;

    fn layout(&self) -> Layout {
        Layout::Explicit
    }

    /// Rows `get_data` would return for this request, when cheaply known.
    /// Lets the row guard reject a request before anything is fetched.
    fn count_rows(&self, _params: &RequestParams, _window: &Window) -> Option<usize> {
        None
    }

    fn get_data(&self, params: &RequestParams, window: &Window) -> Result<SourceData, SourceError>;
}

/// Typed access to a source's `options` table.
pub struct SourceOptions<'a> {
    name: &'a str,
    table: &'a toml::Table,
}

impl<'a> SourceOptions<'a> {
    pub fn new(name: &'a str, table: &'a toml::Table) -> Self {
        SourceOptions { name, table }
    }

    fn invalid(&self, key: &str, message: impl Into<String>) -> SourceError {
        SourceError::InvalidOption {
            name: self.name.to_string(),
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, SourceError> {
        match self.table.get(key) {
            None => Ok(default),
            Some(toml::Value::Float(v)) => Ok(*v),
            Some(toml::Value::Integer(v)) => Ok(*v as f64),
            Some(other) => Err(self.invalid(key, format!("expected a number, got {}", other))),
        }
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, SourceError> {
        match self.table.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(v)) if *v >= 0 => Ok(*v as u64),
            Some(other) => Err(self.invalid(key, format!("expected a non-negative integer, got {}", other))),
        }
    }

    pub fn str(&self, key: &str) -> Result<Option<&'a str>, SourceError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(toml::Value::String(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {}", other))),
        }
    }

    pub fn positive(&self, key: &str, value: f64) -> Result<f64, SourceError> {
        if value > 0.0 && value.is_finite() {
            Ok(value)
        } else {
            Err(self.invalid(key, "must be positive"))
        }
    }
}

/// `action` parameter, defaulting to `data`.
pub fn action(params: &RequestParams) -> &str {
    params.get("action").unwrap_or("data")
}
