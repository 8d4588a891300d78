//! Row Reduction
//!
//! Reduces the rows of a fetched matrix before it is encoded:
//!
//! - `NONE` passes rows through untouched.
//! - `DECIMATE(k)` keeps rows `0, k, 2k, ...` in their original order.
//! - `MEAN(k)` averages every column over half-open buckets of `k` seconds
//!   aligned to the query start. A bucket row is stamped with the bucket
//!   start. Buckets without rows are omitted; a column whose samples in a
//!   bucket are all absent is emitted as `NO_DATA`.
//!
//! The row guard runs against the planned output size before any output
//! row is built.

use crate::matrix::{is_no_data, DataMatrix, MatrixError, NO_DATA, TIME_COLUMN};
use crate::protocol::RequestParams;
use std::collections::BTreeMap;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DownsampleError {
    #[error("max rows ({limit}) exceeded for source '{source_name}' ({rows} rows); use downsampling")]
    RowLimitExceeded {
        limit: usize,
        source_name: String,
        rows: usize,
    },

    #[error("invalid downsampling: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownsampleMode {
    #[default]
    None,
    Decimate,
    Mean,
}

impl DownsampleMode {
    /// Wire code used in the `ds` parameter.
    pub fn code(&self) -> &'static str {
        match self {
            DownsampleMode::None => "N",
            DownsampleMode::Decimate => "D",
            DownsampleMode::Mean => "M",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, DownsampleError> {
        match code.trim().to_ascii_uppercase().as_str() {
            "" | "N" | "NONE" => Ok(DownsampleMode::None),
            "D" | "DECIMATE" => Ok(DownsampleMode::Decimate),
            "M" | "MEAN" => Ok(DownsampleMode::Mean),
            other => Err(DownsampleError::InvalidSpec(format!("unknown mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownsampleSpec {
    pub mode: DownsampleMode,
    pub interval: u32,
}

impl DownsampleSpec {
    pub const NONE: DownsampleSpec = DownsampleSpec {
        mode: DownsampleMode::None,
        interval: 0,
    };

    pub fn new(mode: DownsampleMode, interval: u32) -> Result<Self, DownsampleError> {
        if mode != DownsampleMode::None && interval == 0 {
            return Err(DownsampleError::InvalidSpec(format!(
                "mode {} needs a positive interval",
                mode.code()
            )));
        }
        Ok(DownsampleSpec { mode, interval })
    }

    pub fn decimate(every: u32) -> Result<Self, DownsampleError> {
        Self::new(DownsampleMode::Decimate, every)
    }

    pub fn mean(seconds: u32) -> Result<Self, DownsampleError> {
        Self::new(DownsampleMode::Mean, seconds)
    }

    /// Read `ds` and `dsInt`. A missing `ds` means no reduction.
    pub fn from_params(params: &RequestParams) -> Result<Self, DownsampleError> {
        let mode = DownsampleMode::from_code(params.get("ds").unwrap_or(""))?;
        let interval = match params.get("dsInt") {
            None | Some("") => 0,
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                DownsampleError::InvalidSpec(format!("bad dsInt '{}'", raw))
            })?,
        };
        Self::new(mode, interval)
    }

    /// Write `ds` and `dsInt` into a request.
    pub fn to_params(&self, params: &mut RequestParams) {
        params.insert("ds", self.mode.code());
        params.insert("dsInt", self.interval.to_string());
    }
}

/// Row-count limit applied to one source.
#[derive(Debug, Clone, Copy)]
pub struct RowGuard<'a> {
    /// 0 disables the guard.
    pub max_rows: usize,
    pub source_name: &'a str,
}

impl<'a> RowGuard<'a> {
    pub fn new(max_rows: usize, source_name: &'a str) -> Self {
        RowGuard {
            max_rows,
            source_name,
        }
    }

    pub fn check(&self, rows: usize) -> Result<(), DownsampleError> {
        if self.max_rows > 0 && rows > self.max_rows {
            return Err(DownsampleError::RowLimitExceeded {
                limit: self.max_rows,
                source_name: self.source_name.to_string(),
                rows,
            });
        }
        Ok(())
    }

    /// Check a row count reported by a source before it materializes rows.
    /// Mean buckets depend on timestamps, so only the exact modes are
    /// checked here; the post-fetch check in [`reduce`] covers the rest.
    pub fn check_estimate(&self, raw_rows: usize, spec: DownsampleSpec) -> Result<(), DownsampleError> {
        match spec.mode {
            DownsampleMode::None => self.check(raw_rows),
            DownsampleMode::Decimate => self.check(raw_rows.div_ceil(spec.interval as usize)),
            DownsampleMode::Mean => Ok(()),
        }
    }
}

/// Largest bucket index that stays exact as both f64 and i64.
const MAX_BUCKET: f64 = 9_007_199_254_740_992.0;

/// Bucket index of `time`. Rows with an absent or unrepresentable
/// timestamp belong to no bucket.
fn bucket_of(time: f64, origin: f64, width: f64) -> Option<i64> {
    if is_no_data(time) {
        return None;
    }
    let index = ((time - origin) / width).floor();
    (index.is_finite() && index.abs() <= MAX_BUCKET).then_some(index as i64)
}

/// Number of rows `reduce` would emit.
pub fn planned_rows(matrix: &DataMatrix, spec: DownsampleSpec, origin: f64) -> usize {
    match spec.mode {
        DownsampleMode::None => matrix.rows(),
        DownsampleMode::Decimate => matrix.rows().div_ceil(spec.interval as usize),
        DownsampleMode::Mean => {
            let width = spec.interval as f64;
            let buckets: HashSet<i64, ahash::RandomState> = matrix
                .row_iter()
                .filter_map(|row| bucket_of(row[TIME_COLUMN], origin, width))
                .collect();
            buckets.len()
        }
    }
}

struct Bucket {
    sums: Vec<f64>,
    counts: Vec<usize>,
}

fn mean_buckets(matrix: &DataMatrix, width: f64, origin: f64) -> Result<DataMatrix, MatrixError> {
    let columns = matrix.columns();
    let mut buckets: BTreeMap<i64, Bucket> = BTreeMap::new();
    for row in matrix.row_iter() {
        let Some(index) = bucket_of(row[TIME_COLUMN], origin, width) else {
            continue;
        };
        let bucket = buckets
            .entry(index)
            .or_insert_with(|| Bucket {
                sums: vec![0.0; columns],
                counts: vec![0; columns],
            });
        for (c, &v) in row.iter().enumerate().skip(1) {
            if !is_no_data(v) {
                bucket.sums[c] += v;
                bucket.counts[c] += 1;
            }
        }
    }

    let mut values = Vec::with_capacity(buckets.len() * columns);
    for (index, bucket) in buckets {
        values.push(origin + index as f64 * width);
        for c in 1..columns {
            values.push(match bucket.counts[c] {
                0 => NO_DATA,
                n => bucket.sums[c] / n as f64,
            });
        }
    }
    let mut out = DataMatrix::from_flat(columns, values)?;
    let names = matrix.column_names();
    if !names.is_empty() {
        out.set_column_names(&names)?;
    }
    Ok(out)
}

/// Reduce `matrix` per `spec`. `origin` is the query start time used to
/// align mean buckets. Fails without building output when the guard trips.
pub fn reduce(
    matrix: DataMatrix,
    spec: DownsampleSpec,
    guard: &RowGuard<'_>,
    origin: f64,
) -> Result<DataMatrix, DownsampleError> {
    let planned = planned_rows(&matrix, spec, origin);
    guard.check(planned)?;

    let reduced = match spec.mode {
        DownsampleMode::None => return Ok(matrix),
        DownsampleMode::Decimate => matrix.every_nth_row(spec.interval as usize),
        DownsampleMode::Mean => mean_buckets(&matrix, spec.interval as f64, origin)?,
    };
    debug!(
        source = guard.source_name,
        mode = spec.mode.code(),
        interval = spec.interval,
        rows_in = matrix.rows(),
        rows_out = reduced.rows(),
        "Reduced rows"
    );
    Ok(reduced)
}
