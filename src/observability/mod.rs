//! Logging
//!
//! Components log through `tracing` macros with structured fields
//! (`client = %addr`, `source = %name`, `rows = n`) inside the spans
//! defined here. Binaries call [`init_tracing`] once at startup.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tsdx::config::LogConfig;
//! use tsdx::observability::{init_tracing, request_span};
//!
//! init_tracing(&LogConfig::default())?;
//! let _guard = request_span("getdata").entered();
//! ```

pub mod spans;
pub mod tracing_setup;

pub use spans::*;
pub use tracing_setup::{env_filter, init as init_tracing, InitError};
