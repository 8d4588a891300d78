//! Binary Matrix Codec
//!
//! Two layouts, both big-endian:
//!
//! - **Explicit** `[rows:i32][cols:i32][rows*cols f64]`, repeated once per
//!   block when a result bundles several matrices. Safe for empty results.
//! - **Legacy** `[rows:i32][rows*cols f64]`. The column count is derived
//!   from the buffer length, so zero-row matrices cannot be represented and
//!   are rejected at encode time.
//!
//! Compressed payloads use zstd; the `bytes=` header counts compressed bytes.

use super::{DataMatrix, MatrixError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const COUNT_SIZE: usize = 4;
const VALUE_SIZE: usize = 8;
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("buffer truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("invalid row count: {0}")]
    InvalidRowCount(i64),

    #[error("invalid column count: {0}")]
    InvalidColumnCount(i64),

    #[error("payload of {length} bytes is not a multiple of row stride {stride}")]
    StrideMismatch { length: usize, stride: usize },

    #[error("{0} trailing bytes after matrix block")]
    TrailingBytes(usize),

    #[error("legacy layout cannot encode a matrix with zero rows")]
    EmptyLegacy,

    #[error("legacy layout carries exactly one matrix, got {0}")]
    LegacyBundle(usize),

    #[error("matrix too large to encode: {rows} x {columns}")]
    TooLarge { rows: usize, columns: usize },

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error("compression failed: {0}")]
    Compression(std::io::Error),

    #[error("decompression failed: {0}")]
    Decompression(std::io::Error),
}

/// Byte layout of an encoded matrix payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Legacy,
    #[default]
    Explicit,
}

impl Layout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layout::Legacy => "legacy",
            Layout::Explicit => "explicit",
        }
    }
}

fn count_to_i32(rows: usize, columns: usize) -> Result<(i32, i32), CodecError> {
    match (i32::try_from(rows), i32::try_from(columns)) {
        (Ok(r), Ok(c)) => Ok((r, c)),
        _ => Err(CodecError::TooLarge { rows, columns }),
    }
}

fn put_values(matrix: &DataMatrix, buf: &mut BytesMut) {
    for &v in matrix.as_slice() {
        buf.put_f64(v);
    }
}

/// Encode with the row-count-only layout.
pub fn encode_legacy(matrix: &DataMatrix) -> Result<Bytes, CodecError> {
    if matrix.rows() == 0 {
        return Err(CodecError::EmptyLegacy);
    }
    let (rows, _) = count_to_i32(matrix.rows(), matrix.columns())?;
    let mut buf = BytesMut::with_capacity(COUNT_SIZE + matrix.as_slice().len() * VALUE_SIZE);
    buf.put_i32(rows);
    put_values(matrix, &mut buf);
    Ok(buf.freeze())
}

fn put_explicit_block(matrix: &DataMatrix, buf: &mut BytesMut) -> Result<(), CodecError> {
    let (rows, columns) = count_to_i32(matrix.rows(), matrix.columns())?;
    buf.put_i32(rows);
    buf.put_i32(columns);
    put_values(matrix, buf);
    Ok(())
}

/// Encode a single matrix with the explicit two-count layout.
pub fn encode_explicit(matrix: &DataMatrix) -> Result<Bytes, CodecError> {
    encode_blocks(std::slice::from_ref(matrix))
}

/// Encode several matrices back to back, one explicit block each.
pub fn encode_blocks(blocks: &[DataMatrix]) -> Result<Bytes, CodecError> {
    let size: usize = blocks
        .iter()
        .map(|m| 2 * COUNT_SIZE + m.as_slice().len() * VALUE_SIZE)
        .sum();
    let mut buf = BytesMut::with_capacity(size);
    for block in blocks {
        put_explicit_block(block, &mut buf)?;
    }
    Ok(buf.freeze())
}

/// Encode `blocks` in the given layout.
pub fn encode(blocks: &[DataMatrix], layout: Layout) -> Result<Bytes, CodecError> {
    match layout {
        Layout::Explicit => encode_blocks(blocks),
        Layout::Legacy => match blocks {
            [single] => encode_legacy(single),
            _ => Err(CodecError::LegacyBundle(blocks.len())),
        },
    }
}

fn read_values(buf: &mut &[u8], count: usize) -> Vec<f64> {
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(buf.get_f64());
    }
    values
}

/// Decode the row-count-only layout.
pub fn decode_legacy(mut buf: &[u8]) -> Result<DataMatrix, CodecError> {
    if buf.len() < COUNT_SIZE {
        return Err(CodecError::Truncated {
            needed: COUNT_SIZE,
            available: buf.len(),
        });
    }
    let rows = buf.get_i32();
    if rows <= 0 {
        return Err(CodecError::InvalidRowCount(rows as i64));
    }
    let rows = rows as usize;
    let stride = rows * VALUE_SIZE;
    if buf.len() % stride != 0 {
        return Err(CodecError::StrideMismatch {
            length: buf.len(),
            stride,
        });
    }
    let columns = buf.len() / stride;
    if columns == 0 {
        return Err(CodecError::InvalidColumnCount(0));
    }
    let values = read_values(&mut buf, rows * columns);
    Ok(DataMatrix::from_flat(columns, values)?)
}

fn decode_explicit_block(buf: &mut &[u8]) -> Result<DataMatrix, CodecError> {
    if buf.len() < 2 * COUNT_SIZE {
        return Err(CodecError::Truncated {
            needed: 2 * COUNT_SIZE,
            available: buf.len(),
        });
    }
    let rows = buf.get_i32();
    let columns = buf.get_i32();
    if rows < 0 {
        return Err(CodecError::InvalidRowCount(rows as i64));
    }
    if columns < 0 || (columns == 0 && rows > 0) {
        return Err(CodecError::InvalidColumnCount(columns as i64));
    }
    let (rows, columns) = (rows as usize, columns as usize);
    let needed = rows
        .checked_mul(columns)
        .and_then(|n| n.checked_mul(VALUE_SIZE))
        .ok_or(CodecError::TooLarge { rows, columns })?;
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    let values = read_values(buf, rows * columns);
    Ok(DataMatrix::from_flat(columns, values)?)
}

/// Decode exactly one explicit-layout matrix.
pub fn decode_explicit(mut buf: &[u8]) -> Result<DataMatrix, CodecError> {
    let matrix = decode_explicit_block(&mut buf)?;
    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes(buf.len()));
    }
    Ok(matrix)
}

/// Decode every explicit-layout block in the buffer.
pub fn decode_blocks(mut buf: &[u8]) -> Result<Vec<DataMatrix>, CodecError> {
    let mut blocks = Vec::new();
    while !buf.is_empty() {
        blocks.push(decode_explicit_block(&mut buf)?);
    }
    Ok(blocks)
}

/// Decode `buf` in the given layout.
pub fn decode(buf: &[u8], layout: Layout) -> Result<Vec<DataMatrix>, CodecError> {
    match layout {
        Layout::Explicit => decode_blocks(buf),
        Layout::Legacy => Ok(vec![decode_legacy(buf)?]),
    }
}

pub fn compress(raw: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::encode_all(raw, COMPRESSION_LEVEL).map_err(CodecError::Compression)
}

pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::decode_all(compressed).map_err(CodecError::Decompression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::NO_DATA;

    fn sample(rows: usize) -> DataMatrix {
        let rows = (0..rows)
            .map(|i| vec![i as f64, (i * i) as f64 * 0.5, -(i as f64)])
            .collect();
        DataMatrix::from_rows(rows).unwrap()
    }

    #[test]
    fn test_legacy_layout_bytes() {
        let m = DataMatrix::from_rows(vec![vec![1.0, 2.0]]).unwrap();
        let bytes = encode_legacy(&m).unwrap();
        assert_eq!(bytes.len(), 4 + 16);
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..12], &1.0f64.to_be_bytes());
    }

    #[test]
    fn test_legacy_round_trip() {
        let m = sample(7);
        assert_eq!(decode_legacy(&encode_legacy(&m).unwrap()).unwrap(), m);
    }

    #[test]
    fn test_legacy_rejects_empty() {
        assert!(matches!(
            encode_legacy(&DataMatrix::new(3)),
            Err(CodecError::EmptyLegacy)
        ));
        let zero_rows = 0i32.to_be_bytes();
        assert!(matches!(
            decode_legacy(&zero_rows),
            Err(CodecError::InvalidRowCount(0))
        ));
    }

    #[test]
    fn test_legacy_rejects_bad_stride() {
        let mut buf = encode_legacy(&sample(3)).unwrap().to_vec();
        buf.pop();
        assert!(matches!(
            decode_legacy(&buf),
            Err(CodecError::StrideMismatch { .. })
        ));

        let header_only = 2i32.to_be_bytes();
        assert!(matches!(
            decode_legacy(&header_only),
            Err(CodecError::InvalidColumnCount(0))
        ));
    }

    #[test]
    fn test_explicit_round_trip_with_no_data() {
        let mut m = sample(5);
        m.set(2, 1, NO_DATA);
        let bytes = encode_explicit(&m).unwrap();
        assert_eq!(bytes.len(), 8 + 5 * 3 * 8);
        assert_eq!(decode_explicit(&bytes).unwrap(), m);
    }

    #[test]
    fn test_explicit_zero_rows_keeps_shape() {
        let empty = DataMatrix::new(4);
        let decoded = decode_explicit(&encode_explicit(&empty).unwrap()).unwrap();
        assert_eq!(decoded.rows(), 0);
        assert_eq!(decoded.columns(), 4);
    }

    #[test]
    fn test_explicit_truncated_and_trailing() {
        let bytes = encode_explicit(&sample(2)).unwrap();
        assert!(matches!(
            decode_explicit(&bytes[..bytes.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));

        let mut extra = bytes.to_vec();
        extra.push(0);
        assert!(matches!(
            decode_explicit(&extra),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_bundle_round_trip() {
        let values = sample(4);
        let events = DataMatrix::from_rows(vec![vec![1.5, 9.0]]).unwrap();
        let empty = DataMatrix::new(2);
        let blocks = vec![values, events, empty];

        let decoded = decode(&encode(&blocks, Layout::Explicit).unwrap(), Layout::Explicit).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], blocks[0]);
        assert_eq!(decoded[1], blocks[1]);
        assert_eq!(decoded[2].columns(), 2);

        assert!(matches!(
            encode(&blocks, Layout::Legacy),
            Err(CodecError::LegacyBundle(3))
        ));
    }

    #[test]
    fn test_compression_round_trip() {
        let raw = encode_explicit(&sample(200)).unwrap();
        let packed = compress(&raw).unwrap();
        assert!(packed.len() < raw.len());
        assert_eq!(decompress(&packed).unwrap(), raw.to_vec());
        assert!(decompress(b"not zstd").is_err());
    }
}
