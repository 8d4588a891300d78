//! Columnar Time-Series Matrix
//!
//! A `DataMatrix` holds rows of `f64` values with a fixed column count.
//! Column 0 is always the timestamp in j2ksec. Values equal to [`NO_DATA`]
//! (or NaN) mark absent samples and are skipped by every aggregate and
//! column operation.
//!
//! Storage is a single row-major buffer so the binary codec can stream it
//! without per-row allocations.

pub mod codec;
pub mod merge;

use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;

/// Sentinel marking an absent sample.
pub const NO_DATA: f64 = f64::MIN;

/// Index of the timestamp column.
pub const TIME_COLUMN: usize = 0;

/// True if `value` is the no-data sentinel (or NaN).
#[inline]
pub fn is_no_data(value: f64) -> bool {
    value == NO_DATA || value.is_nan()
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MatrixError {
    #[error("row {row} has {found} columns, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("column {column} out of range for matrix with {columns} columns")]
    ColumnOutOfRange { column: usize, columns: usize },

    #[error("column count mismatch: {left} vs {right}")]
    ColumnMismatch { left: usize, right: usize },

    #[error("duplicate column name: {0}")]
    DuplicateName(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),
}

type NameMap = HashMap<String, usize, ahash::RandomState>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataMatrix {
    columns: usize,
    values: Vec<f64>,
    names: NameMap,
}

impl DataMatrix {
    /// Empty matrix with a fixed column count.
    pub fn new(columns: usize) -> Self {
        DataMatrix {
            columns,
            values: Vec::new(),
            names: NameMap::default(),
        }
    }

    /// Build from a list of rows. All rows must have the same length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, MatrixError> {
        let columns = rows.first().map(Vec::len).unwrap_or(0);
        let mut values = Vec::with_capacity(rows.len() * columns);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != columns {
                return Err(MatrixError::RaggedRow {
                    row: i,
                    expected: columns,
                    found: row.len(),
                });
            }
            values.extend(row);
        }
        Ok(DataMatrix {
            columns,
            values,
            names: NameMap::default(),
        })
    }

    /// Build from a row-major buffer.
    pub fn from_flat(columns: usize, values: Vec<f64>) -> Result<Self, MatrixError> {
        if (columns == 0 && !values.is_empty()) || (columns > 0 && values.len() % columns != 0) {
            return Err(MatrixError::RaggedRow {
                row: if columns == 0 { 0 } else { values.len() / columns },
                expected: columns,
                found: if columns == 0 { values.len() } else { values.len() % columns },
            });
        }
        Ok(DataMatrix {
            columns,
            values,
            names: NameMap::default(),
        })
    }

    /// Attach column names, in column order.
    pub fn with_column_names<S: AsRef<str>>(mut self, names: &[S]) -> Result<Self, MatrixError> {
        self.set_column_names(names)?;
        Ok(self)
    }

    pub fn set_column_names<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), MatrixError> {
        if names.len() > self.columns {
            return Err(MatrixError::ColumnOutOfRange {
                column: names.len() - 1,
                columns: self.columns,
            });
        }
        let mut map = NameMap::default();
        for (i, name) in names.iter().enumerate() {
            let name = name.as_ref().to_string();
            if map.insert(name.clone(), i).is_some() {
                return Err(MatrixError::DuplicateName(name));
            }
        }
        self.names = map;
        Ok(())
    }

    /// Column names ordered by column index. Unnamed columns are skipped.
    pub fn column_names(&self) -> Vec<&str> {
        let mut named: Vec<(&str, usize)> =
            self.names.iter().map(|(n, &i)| (n.as_str(), i)).collect();
        named.sort_by_key(|&(_, i)| i);
        named.into_iter().map(|(n, _)| n).collect()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, MatrixError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| MatrixError::UnknownColumn(name.to_string()))
    }

    pub fn rows(&self) -> usize {
        if self.columns == 0 {
            0
        } else {
            self.values.len() / self.columns
        }
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn row(&self, index: usize) -> &[f64] {
        let start = index * self.columns;
        &self.values[start..start + self.columns]
    }

    pub fn row_iter(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks_exact(self.columns.max(1))
    }

    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.values[row * self.columns + column]
    }

    pub fn set(&mut self, row: usize, column: usize, value: f64) {
        self.values[row * self.columns + column] = value;
    }

    /// Timestamp of a row.
    pub fn time(&self, row: usize) -> f64 {
        self.get(row, TIME_COLUMN)
    }

    pub fn first_time(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.time(0))
    }

    pub fn last_time(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.time(self.rows() - 1))
    }

    pub fn column_values(&self, column: usize) -> Result<Vec<f64>, MatrixError> {
        self.check_column(column)?;
        Ok(self.row_iter().map(|r| r[column]).collect())
    }

    /// Raw row-major values.
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn push_row(&mut self, row: &[f64]) -> Result<(), MatrixError> {
        if row.len() != self.columns {
            return Err(MatrixError::RaggedRow {
                row: self.rows(),
                expected: self.columns,
                found: row.len(),
            });
        }
        self.values.extend_from_slice(row);
        Ok(())
    }

    /// Copy of the rows in `range`, keeping column names.
    pub fn slice_rows(&self, range: Range<usize>) -> DataMatrix {
        let values = self.values[range.start * self.columns..range.end * self.columns].to_vec();
        DataMatrix {
            columns: self.columns,
            values,
            names: self.names.clone(),
        }
    }

    /// Copy of every `step`-th row starting at row 0.
    pub fn every_nth_row(&self, step: usize) -> DataMatrix {
        let mut out = DataMatrix {
            columns: self.columns,
            values: Vec::with_capacity(self.rows().div_ceil(step.max(1)) * self.columns),
            names: self.names.clone(),
        };
        for row in self.row_iter().step_by(step.max(1)) {
            out.values.extend_from_slice(row);
        }
        out
    }

    /// Stable sort of rows by timestamp.
    pub fn sort_by_time(&mut self) {
        if self.columns == 0 || self.is_sorted_by_time() {
            return;
        }
        let mut rows: Vec<&[f64]> = self.values.chunks_exact(self.columns).collect();
        rows.sort_by(|a, b| a[TIME_COLUMN].total_cmp(&b[TIME_COLUMN]));
        self.values = rows.concat();
    }

    pub fn is_sorted_by_time(&self) -> bool {
        (1..self.rows()).all(|i| self.time(i - 1) <= self.time(i))
    }

    /// Vertical stack of `a` then `b`. No reordering or dedup.
    pub fn concatenate(a: &DataMatrix, b: &DataMatrix) -> Result<DataMatrix, MatrixError> {
        let mut out = a.clone();
        out.append(b)?;
        Ok(out)
    }

    /// Append all rows of `other`.
    pub fn append(&mut self, other: &DataMatrix) -> Result<(), MatrixError> {
        self.append_rows(other, 0..other.rows())
    }

    /// Append the rows of `other` in `range`.
    pub fn append_rows(&mut self, other: &DataMatrix, range: Range<usize>) -> Result<(), MatrixError> {
        if self.is_empty() && self.columns == 0 {
            self.columns = other.columns;
            if self.names.is_empty() {
                self.names = other.names.clone();
            }
        }
        if other.columns != self.columns {
            return Err(MatrixError::ColumnMismatch {
                left: self.columns,
                right: other.columns,
            });
        }
        self.values
            .extend_from_slice(&other.values[range.start * other.columns..range.end * other.columns]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Column operations
    // ------------------------------------------------------------------

    fn check_column(&self, column: usize) -> Result<(), MatrixError> {
        if column >= self.columns {
            return Err(MatrixError::ColumnOutOfRange {
                column,
                columns: self.columns,
            });
        }
        Ok(())
    }

    fn column_mut(&mut self, column: usize) -> impl Iterator<Item = &mut f64> {
        self.values
            .chunks_exact_mut(self.columns.max(1))
            .map(move |row| &mut row[column])
    }

    pub fn add(&mut self, column: usize, k: f64) -> Result<(), MatrixError> {
        self.check_column(column)?;
        for v in self.column_mut(column).filter(|v| !is_no_data(**v)) {
            *v += k;
        }
        Ok(())
    }

    pub fn multiply(&mut self, column: usize, k: f64) -> Result<(), MatrixError> {
        self.check_column(column)?;
        for v in self.column_mut(column).filter(|v| !is_no_data(**v)) {
            *v *= k;
        }
        Ok(())
    }

    /// Running sum down a column. Absent samples stay absent and do not
    /// reset the running total.
    pub fn cumulative_sum(&mut self, column: usize) -> Result<(), MatrixError> {
        self.check_column(column)?;
        let mut total = 0.0;
        for v in self.column_mut(column).filter(|v| !is_no_data(**v)) {
            total += *v;
            *v = total;
        }
        Ok(())
    }

    /// Subtract the least-squares line fitted against the time column.
    /// Columns with fewer than two usable samples are left unchanged.
    pub fn detrend(&mut self, column: usize) -> Result<(), MatrixError> {
        let Some((slope, intercept)) = self.least_squares(column)? else {
            return Ok(());
        };
        let columns = self.columns;
        for row in self.values.chunks_exact_mut(columns) {
            if !is_no_data(row[column]) && !is_no_data(row[TIME_COLUMN]) {
                row[column] -= slope * row[TIME_COLUMN] + intercept;
            }
        }
        Ok(())
    }

    fn present(&self, column: usize, range: Range<usize>) -> impl Iterator<Item = f64> + '_ {
        self.values[range.start * self.columns..range.end * self.columns]
            .chunks_exact(self.columns.max(1))
            .map(move |row| row[column])
            .filter(|v| !is_no_data(*v))
    }

    pub fn min(&self, column: usize) -> Result<Option<f64>, MatrixError> {
        self.check_column(column)?;
        Ok(self.present(column, 0..self.rows()).reduce(f64::min))
    }

    pub fn max(&self, column: usize) -> Result<Option<f64>, MatrixError> {
        self.check_column(column)?;
        Ok(self.present(column, 0..self.rows()).reduce(f64::max))
    }

    pub fn mean(&self, column: usize) -> Result<Option<f64>, MatrixError> {
        self.mean_in(column, 0..self.rows())
    }

    /// Mean of a column over a row range, skipping absent samples.
    pub fn mean_in(&self, column: usize, range: Range<usize>) -> Result<Option<f64>, MatrixError> {
        self.check_column(column)?;
        let (sum, count) = self
            .present(column, range)
            .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        Ok((count > 0).then(|| sum / count as f64))
    }

    /// Ordinary least squares of `column` against the time column.
    /// Returns `(slope, intercept)`, or `None` when the fit is undefined.
    pub fn least_squares(&self, column: usize) -> Result<Option<(f64, f64)>, MatrixError> {
        self.check_column(column)?;
        let points: Vec<(f64, f64)> = self
            .row_iter()
            .map(|row| (row[TIME_COLUMN], row[column]))
            .filter(|(x, y)| !is_no_data(*x) && !is_no_data(*y))
            .collect();
        if points.len() < 2 {
            return Ok(None);
        }

        // Centered sums keep precision with j2ksec-sized abscissae.
        let n = points.len() as f64;
        let x_mean = points.iter().map(|p| p.0).sum::<f64>() / n;
        let y_mean = points.iter().map(|p| p.1).sum::<f64>() / n;
        let (sxx, sxy) = points.iter().fold((0.0, 0.0), |(sxx, sxy), (x, y)| {
            let dx = x - x_mean;
            (sxx + dx * dx, sxy + dx * (y - y_mean))
        });
        if sxx == 0.0 {
            return Ok(None);
        }
        let slope = sxy / sxx;
        Ok(Some((slope, y_mean - slope * x_mean)))
    }
}
