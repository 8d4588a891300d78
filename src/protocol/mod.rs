//! Wire Protocol
//!
//! Requests are single ASCII lines, `<command>: key1=val1;key2=val2\n`.
//! Responses start with a status line and, for counted responses, carry a
//! body whose size is declared in that line. See [`response`] for framing.

pub mod codec;
pub mod request;
pub mod response;
pub mod result;

use thiserror::Error;

pub use codec::{RequestFrame, RequestLineCodec};
pub use request::{parse_request, Command, Request, RequestParams};
pub use response::{parse_status_line, serialize, Response, SourceInfo, StatusLine};
pub use result::{BinaryPayload, RequestResult, ResponseHeader};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed parameter: {0}")]
    MalformedParameter(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("invalid value for {key}: {value}")]
    InvalidParameter { key: String, value: String },

    #[error("parameter contains a delimiter: {0}")]
    DelimiterInValue(String),

    #[error("malformed response header: {0}")]
    MalformedHeader(String),

    #[error("request line too long ({0} bytes)")]
    LineTooLong(usize),
}
