use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Longest request line accepted before the line is discarded.
pub const MAX_REQUEST_LINE: usize = 8 * 1024;

/// Item produced by [`RequestLineCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFrame {
    Line(String),
    /// A line exceeded the limit and was dropped; the connection stays usable.
    Oversized(usize),
}

/// Splits the inbound byte stream into newline-terminated request lines.
#[derive(Debug, Clone)]
pub struct RequestLineCodec {
    max_length: usize,
    /// Bytes of an oversized line dropped so far.
    discarding: Option<usize>,
}

impl RequestLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_REQUEST_LINE)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        RequestLineCodec {
            max_length,
            discarding: None,
        }
    }
}

impl Default for RequestLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RequestLineCodec {
    type Item = RequestFrame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RequestFrame>, std::io::Error> {
        loop {
            let newline = memchr::memchr(b'\n', &buf[..]);

            if let Some(dropped) = self.discarding {
                match newline {
                    Some(pos) => {
                        buf.advance(pos + 1);
                        self.discarding = None;
                        return Ok(Some(RequestFrame::Oversized(dropped + pos)));
                    }
                    None => {
                        self.discarding = Some(dropped + buf.len());
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            match newline {
                Some(pos) if pos <= self.max_length => {
                    let line = buf.split_to(pos + 1);
                    let text = String::from_utf8_lossy(&line[..pos]);
                    let text = text.trim_end_matches('\r');
                    if text.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(RequestFrame::Line(text.to_string())));
                }
                Some(_) => {
                    self.discarding = Some(0);
                }
                None if buf.len() > self.max_length => {
                    self.discarding = Some(0);
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RequestFrame>, std::io::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // An unterminated trailing line is still a request.
                if buf.is_empty() || self.discarding.is_some() {
                    buf.clear();
                    return Ok(None);
                }
                let text = String::from_utf8_lossy(&buf[..]).trim().to_string();
                buf.clear();
                Ok((!text.is_empty()).then_some(RequestFrame::Line(text)))
            }
        }
    }
}
