//! Response Framing
//!
//! ```text
//! version=<v>\n                          version (plain line)
//! ok: lines=<N>\n + N lines               text (menu included)
//! ok: type=<kind>;bytes=<M>\n + M bytes   binary, zstd-compressed matrix
//! error: <message>\n                      any failure, no body
//! ```
//!
//! A response is always built as one complete buffer so it can be written
//! with a single `write_all`; a declared byte count is never sent short.

use super::result::{RequestResult, ResponseHeader, BYTES_FIELD, LAYOUT_FIELD, LINES_FIELD};
use super::ProtocolError;
use crate::matrix::codec::{self, CodecError, Layout};
use crate::matrix::DataMatrix;
use bytes::{BufMut, BytesMut};
use tracing::warn;

pub const OK_STATUS: &str = "ok";
pub const ERROR_STATUS: &str = "error";
pub const VERSION_PREFIX: &str = "version=";

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_u8(b'\n');
}

/// `error: <message>\n`
pub fn error_line(message: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(message.len() + 8);
    put_line(&mut buf, &format!("{}: {}", ERROR_STATUS, single_line(message)));
    buf
}

/// `version=<v>\n`
pub fn version_line(version: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(version.len() + 9);
    put_line(&mut buf, &format!("{}{}", VERSION_PREFIX, version));
    buf
}

fn encode_text(header: &ResponseHeader, lines: &[String]) -> BytesMut {
    let mut header = header.clone();
    header.set(LINES_FIELD, lines.len());
    let mut buf = BytesMut::with_capacity(64 + lines.iter().map(|l| l.len() + 1).sum::<usize>());
    put_line(&mut buf, &format!("{}: {}", OK_STATUS, header));
    for line in lines {
        put_line(&mut buf, &single_line(line));
    }
    buf
}

fn encode_binary(
    header: &ResponseHeader,
    blocks: &[DataMatrix],
    layout: Layout,
) -> Result<BytesMut, CodecError> {
    let raw = codec::encode(blocks, layout)?;
    let compressed = codec::compress(&raw)?;

    let mut header = header.clone();
    if layout == Layout::Legacy {
        header.set(LAYOUT_FIELD, layout.as_str());
    }
    header.set(BYTES_FIELD, compressed.len());

    let mut buf = BytesMut::with_capacity(64 + compressed.len());
    put_line(&mut buf, &format!("{}: {}", OK_STATUS, header));
    buf.put_slice(&compressed);
    Ok(buf)
}

/// Serialize a result into header line plus body. Encoding failures turn
/// into an error line before anything is written.
pub fn serialize(result: &RequestResult) -> BytesMut {
    match result {
        RequestResult::Text { header, lines } => encode_text(header, lines),
        RequestResult::Binary { header, payload } => {
            match encode_binary(header, &payload.blocks, payload.layout) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!(error = %e, "Failed to encode binary result");
                    error_line(&e.to_string())
                }
            }
        }
        RequestResult::Error { message } => error_line(message),
    }
}

/// First line of a counted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    Ok(ResponseHeader),
    Error(String),
}

pub fn parse_status_line(line: &str) -> Result<StatusLine, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(':') {
        Some((OK_STATUS, rest)) => Ok(StatusLine::Ok(ResponseHeader::parse(rest)?)),
        Some((ERROR_STATUS, rest)) => Ok(StatusLine::Error(rest.trim().to_string())),
        _ => Err(ProtocolError::MalformedHeader(line.to_string())),
    }
}

/// Decompress and decode a binary body.
pub fn decode_binary(body: &[u8], layout: Layout) -> Result<Vec<DataMatrix>, CodecError> {
    let raw = codec::decompress(body)?;
    codec::decode(&raw, layout)
}

/// A fully read response, as seen by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Text {
        header: ResponseHeader,
        lines: Vec<String>,
    },
    Binary {
        header: ResponseHeader,
        blocks: Vec<DataMatrix>,
    },
    Error(String),
}

impl Response {
    pub fn kind(&self) -> Option<&str> {
        match self {
            Response::Text { header, .. } | Response::Binary { header, .. } => header.kind(),
            Response::Error(_) => None,
        }
    }

    /// Primary matrix of a binary response.
    pub fn into_matrix(self) -> Option<DataMatrix> {
        match self {
            Response::Binary { blocks, .. } => blocks.into_iter().next(),
            _ => None,
        }
    }

    pub fn into_lines(self) -> Option<Vec<String>> {
        match self {
            Response::Text { lines, .. } => Some(lines),
            _ => None,
        }
    }
}

/// One `menu` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub name: String,
    pub description: String,
    pub kind: String,
}

impl SourceInfo {
    /// `source=<name>; description=<desc>; type=<type>;`
    pub fn to_line(&self) -> String {
        format!(
            "source={}; description={}; type={};",
            self.name,
            single_line(&self.description).replace([';', '='], ","),
            self.kind
        )
    }

    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        let header = ResponseHeader::parse(line)?;
        let field = |key: &str| {
            header
                .get(key)
                .map(String::from)
                .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))
        };
        Ok(SourceInfo {
            name: field("source")?,
            description: field("description")?,
            kind: field("type")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::result::BinaryPayload;

    fn header_line(buf: &[u8]) -> (&str, &[u8]) {
        let end = buf.iter().position(|&b| b == b'\n').unwrap();
        (std::str::from_utf8(&buf[..end]).unwrap(), &buf[end + 1..])
    }

    #[test]
    fn test_text_framing_is_counted() {
        let result = RequestResult::text(vec!["a".into(), "b\nc".into()]);
        let buf = serialize(&result);
        assert_eq!(&buf[..], b"ok: lines=2\na\nb c\n");
    }

    #[test]
    fn test_binary_framing() {
        let matrix = DataMatrix::from_rows((0..50).map(|i| vec![i as f64, 1.0]).collect()).unwrap();
        let result = RequestResult::binary("tilt", BinaryPayload::single(matrix.clone(), Layout::Explicit));
        let buf = serialize(&result);

        let (line, body) = header_line(&buf);
        let StatusLine::Ok(header) = parse_status_line(line).unwrap() else {
            panic!("expected ok header, got {}", line);
        };
        assert_eq!(header.kind(), Some("tilt"));
        assert_eq!(header.byte_count().unwrap(), Some(body.len()));
        assert_eq!(line, format!("ok: type=tilt;bytes={}", body.len()));

        let blocks = decode_binary(body, header.layout().unwrap()).unwrap();
        assert_eq!(blocks, vec![matrix]);
    }

    #[test]
    fn test_legacy_layout_is_flagged() {
        let matrix = DataMatrix::from_rows(vec![vec![0.0, 1.0]]).unwrap();
        let buf = serialize(&RequestResult::binary(
            "hypo",
            BinaryPayload::single(matrix.clone(), Layout::Legacy),
        ));
        let (line, body) = header_line(&buf);
        let StatusLine::Ok(header) = parse_status_line(line).unwrap() else {
            panic!("expected ok header");
        };
        assert_eq!(header.layout().unwrap(), Layout::Legacy);
        assert_eq!(decode_binary(body, Layout::Legacy).unwrap(), vec![matrix]);
    }

    #[test]
    fn test_empty_legacy_becomes_error_line() {
        let buf = serialize(&RequestResult::binary(
            "hypo",
            BinaryPayload::single(DataMatrix::new(2), Layout::Legacy),
        ));
        assert!(buf.starts_with(b"error: "));
        assert_eq!(buf.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_error_collapses_to_one_line() {
        let buf = serialize(&RequestResult::error("unknown source: x\nmore"));
        assert_eq!(&buf[..], b"error: unknown source: x more\n");
        assert_eq!(
            parse_status_line("error: unknown source: x").unwrap(),
            StatusLine::Error("unknown source: x".into())
        );
    }

    #[test]
    fn test_status_line_rejects_garbage() {
        assert!(parse_status_line("version=1.0.0").is_err());
        assert!(parse_status_line("okay: lines=1").is_err());
    }

    #[test]
    fn test_menu_line_round_trip() {
        let info = SourceInfo {
            name: "tilt".into(),
            description: "Kilauea tilt; summit".into(),
            kind: "tilt".into(),
        };
        let line = info.to_line();
        assert_eq!(line, "source=tilt; description=Kilauea tilt, summit; type=tilt;");
        assert_eq!(SourceInfo::parse_line(&line).unwrap().description, "Kilauea tilt, summit");
    }
}
