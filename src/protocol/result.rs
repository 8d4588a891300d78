use super::request::{KEY_VALUE_SEPARATOR, PAIR_SEPARATOR};
use super::ProtocolError;
use crate::matrix::codec::Layout;
use crate::matrix::DataMatrix;
use std::fmt;

pub const TYPE_FIELD: &str = "type";
pub const BYTES_FIELD: &str = "bytes";
pub const LINES_FIELD: &str = "lines";
pub const LAYOUT_FIELD: &str = "layout";

/// Ordered `key=value` fields written on the first line of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    fields: Vec<(String, String)>,
}

impl ResponseHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing it in place if already present.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(field) => field.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Matrix flavor of the payload.
    pub fn kind(&self) -> Option<&str> {
        self.get(TYPE_FIELD)
    }

    fn count(&self, key: &str) -> Result<Option<usize>, ProtocolError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ProtocolError::MalformedHeader(format!("{}={}", key, raw))),
        }
    }

    pub fn byte_count(&self) -> Result<Option<usize>, ProtocolError> {
        self.count(BYTES_FIELD)
    }

    pub fn line_count(&self) -> Result<Option<usize>, ProtocolError> {
        self.count(LINES_FIELD)
    }

    pub fn layout(&self) -> Result<Layout, ProtocolError> {
        match self.get(LAYOUT_FIELD) {
            None | Some("explicit") => Ok(Layout::Explicit),
            Some("legacy") => Ok(Layout::Legacy),
            Some(other) => Err(ProtocolError::MalformedHeader(format!(
                "{}={}",
                LAYOUT_FIELD, other
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse `key=value;key=value`.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let mut header = ResponseHeader::new();
        for field in raw.split(PAIR_SEPARATOR) {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let (key, value) = field
                .split_once(KEY_VALUE_SEPARATOR)
                .ok_or_else(|| ProtocolError::MalformedHeader(field.to_string()))?;
            header.set(key.trim(), value.trim());
        }
        Ok(header)
    }
}

impl fmt::Display for ResponseHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", PAIR_SEPARATOR)?;
            }
            write!(f, "{}{}{}", key, KEY_VALUE_SEPARATOR, value)?;
        }
        Ok(())
    }
}

/// Matrices carried by a binary result. The first block is the primary
/// series; further blocks are secondary series bundled with it.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryPayload {
    pub blocks: Vec<DataMatrix>,
    pub layout: Layout,
}

impl BinaryPayload {
    pub fn single(matrix: DataMatrix, layout: Layout) -> Self {
        BinaryPayload {
            blocks: vec![matrix],
            layout,
        }
    }

    pub fn bundle(blocks: Vec<DataMatrix>) -> Self {
        BinaryPayload {
            blocks,
            layout: Layout::Explicit,
        }
    }

    pub fn primary(&self) -> Option<&DataMatrix> {
        self.blocks.first()
    }
}

/// Outcome of one request, ready to be serialized.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestResult {
    Text {
        header: ResponseHeader,
        lines: Vec<String>,
    },
    Binary {
        header: ResponseHeader,
        payload: BinaryPayload,
    },
    Error {
        message: String,
    },
}

impl RequestResult {
    pub fn text(lines: Vec<String>) -> Self {
        RequestResult::Text {
            header: ResponseHeader::new(),
            lines,
        }
    }

    /// Binary result tagged with the source's matrix flavor.
    pub fn binary(kind: &str, payload: BinaryPayload) -> Self {
        let mut header = ResponseHeader::new();
        header.set(TYPE_FIELD, kind);
        RequestResult::Binary { header, payload }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RequestResult::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RequestResult::Error { .. })
    }

    /// Header fields known before serialization. Errors carry none.
    pub fn header(&self) -> Option<&ResponseHeader> {
        match self {
            RequestResult::Text { header, .. } | RequestResult::Binary { header, .. } => Some(header),
            RequestResult::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_keeps_insertion_order() {
        let mut header = ResponseHeader::new();
        header.set("type", "tilt");
        header.set("bytes", 120);
        assert_eq!(header.to_string(), "type=tilt;bytes=120");

        header.set("type", "rsam");
        assert_eq!(header.to_string(), "type=rsam;bytes=120");
    }

    #[test]
    fn test_header_parse_and_counts() {
        let header = ResponseHeader::parse("type=gps;bytes=42").unwrap();
        assert_eq!(header.kind(), Some("gps"));
        assert_eq!(header.byte_count().unwrap(), Some(42));
        assert_eq!(header.line_count().unwrap(), None);
        assert_eq!(header.layout().unwrap(), Layout::Explicit);

        let bad = ResponseHeader::parse("lines=many").unwrap();
        assert!(bad.line_count().is_err());
        assert!(ResponseHeader::parse("garbage").is_err());
    }

    #[test]
    fn test_result_constructors() {
        let binary = RequestResult::binary("tilt", BinaryPayload::single(DataMatrix::new(2), Layout::Explicit));
        assert_eq!(binary.header().and_then(|h| h.kind()), Some("tilt"));
        assert!(RequestResult::error("boom").is_error());
        assert!(RequestResult::error("boom").header().is_none());
    }
}
