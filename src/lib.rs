pub mod matrix;
pub mod downsample;
pub mod protocol;
pub mod source;
pub mod server;
pub mod client;
pub mod config;
pub mod time;
pub mod observability;

pub use matrix::{DataMatrix, NO_DATA};
pub use downsample::{DownsampleMode, DownsampleSpec};
pub use protocol::{Request, RequestParams, RequestResult, Response};
pub use source::{DataSource, SourceData, SourceRegistry, Window};
pub use server::DataServer;
pub use client::{DataClient, RetryPolicy};
pub use config::{ClientConfig, ServerConfig};
