//! Time-Window Stitching
//!
//! Successive fetches produce time-sorted fragments which are folded into a
//! single growing series. All lookups are binary searches over the time
//! column, so callers must hand in rows sorted by timestamp.

use super::{DataMatrix, MatrixError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MergeError {
    #[error("cannot order windows [{existing_start}, {existing_end}] and [{incoming_start}, {incoming_end}]")]
    UnorderedWindows {
        existing_start: f64,
        existing_end: f64,
        incoming_start: f64,
        incoming_end: f64,
    },

    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// First row index whose time does not satisfy `pred`.
fn partition_point(matrix: &DataMatrix, pred: impl Fn(f64) -> bool) -> usize {
    let (mut lo, mut hi) = (0, matrix.rows());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(matrix.time(mid)) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Index of the first row with time `>= t`.
pub fn find_index_at_or_after(matrix: &DataMatrix, t: f64) -> Option<usize> {
    let index = partition_point(matrix, |time| time < t);
    (index < matrix.rows()).then_some(index)
}

/// Index of the last row with time `<= t`.
pub fn find_index_at_or_before(matrix: &DataMatrix, t: f64) -> Option<usize> {
    partition_point(matrix, |time| time <= t).checked_sub(1)
}

/// Index of the first row with time strictly greater than `t`.
fn find_index_after(matrix: &DataMatrix, t: f64) -> usize {
    partition_point(matrix, |time| time <= t)
}

/// Row range covering `[t1, t2]`, or `None` if it is empty.
pub fn locate(matrix: &DataMatrix, t1: f64, t2: f64) -> Option<std::ops::RangeInclusive<usize>> {
    let first = find_index_at_or_after(matrix, t1)?;
    let last = find_index_at_or_before(matrix, t2)?;
    (first <= last).then_some(first..=last)
}

/// Rows with timestamps in `[t1, t2]`.
pub fn subset(matrix: &DataMatrix, t1: f64, t2: f64) -> Option<DataMatrix> {
    let range = locate(matrix, t1, t2)?;
    Some(matrix.slice_rows(*range.start()..*range.end() + 1))
}

/// Mean of `column` over rows in `[t1, t2]`, skipping absent samples.
pub fn bias_between(
    matrix: &DataMatrix,
    column: usize,
    t1: f64,
    t2: f64,
) -> Result<Option<f64>, MatrixError> {
    match locate(matrix, t1, t2) {
        Some(range) => matrix.mean_in(column, *range.start()..*range.end() + 1),
        None => Ok(None),
    }
}

/// Subtract the `[t1, t2]` bias from the whole column. Returns the bias
/// removed, or `None` (matrix untouched) when the window holds no samples.
pub fn remove_bias(
    matrix: &mut DataMatrix,
    column: usize,
    t1: f64,
    t2: f64,
) -> Result<Option<f64>, MatrixError> {
    let bias = bias_between(matrix, column, t1, t2)?;
    if let Some(b) = bias {
        matrix.add(column, -b)?;
    }
    Ok(bias)
}

/// A non-empty, time-sorted piece of a series.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    matrix: DataMatrix,
    start: f64,
    end: f64,
}

impl Fragment {
    /// Wrap a sorted matrix. Returns `None` for an empty matrix.
    pub fn new(matrix: DataMatrix) -> Option<Self> {
        let start = matrix.first_time()?;
        let end = matrix.last_time()?;
        Some(Fragment { matrix, start, end })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn matrix(&self) -> &DataMatrix {
        &self.matrix
    }

    pub fn into_matrix(self) -> DataMatrix {
        self.matrix
    }

    pub fn overlaps(&self, other: &Fragment) -> bool {
        overlaps(self, other)
    }

    /// True if `other`'s window lies within this one.
    pub fn contains(&self, other: &Fragment) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

pub fn overlaps(a: &Fragment, b: &Fragment) -> bool {
    a.start <= b.end && b.start <= a.end
}

/// Keep all of `head`, then append the rows of `tail` strictly after `head`'s end.
fn stitch(mut head: Fragment, tail: Fragment) -> Result<Fragment, MergeError> {
    let from = find_index_after(&tail.matrix, head.end);
    if from < tail.matrix.rows() {
        head.matrix
            .append_rows(&tail.matrix, from..tail.matrix.rows())?;
        head.end = tail.end;
    }
    Ok(head)
}

/// Check that `combine(existing, incoming)` would succeed, without
/// consuming either fragment.
pub fn check_combinable(existing: &Fragment, incoming: &Fragment) -> Result<(), MergeError> {
    if incoming.contains(existing) || existing.contains(incoming) {
        return Ok(());
    }
    if !(existing.start <= incoming.start || incoming.start <= existing.start) {
        return Err(MergeError::UnorderedWindows {
            existing_start: existing.start,
            existing_end: existing.end,
            incoming_start: incoming.start,
            incoming_end: incoming.end,
        });
    }
    if existing.matrix.columns() != incoming.matrix.columns() {
        return Err(MatrixError::ColumnMismatch {
            left: existing.matrix.columns(),
            right: incoming.matrix.columns(),
        }
        .into());
    }
    Ok(())
}

/// Fold `incoming` into `existing`. Both fragments are consumed.
pub fn combine(existing: Fragment, incoming: Fragment) -> Result<Fragment, MergeError> {
    check_combinable(&existing, &incoming)?;
    if incoming.contains(&existing) {
        return Ok(incoming);
    }
    if existing.contains(&incoming) {
        return Ok(existing);
    }
    if existing.start <= incoming.start {
        stitch(existing, incoming)
    } else {
        stitch(incoming, existing)
    }
}

/// Accumulates fetched fragments into one continuous series.
#[derive(Debug, Default)]
pub struct SeriesAssembler {
    series: Option<Fragment>,
}

impl SeriesAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a freshly fetched matrix. Empty matrices are ignored. On error
    /// the assembled series is left as it was.
    pub fn push(&mut self, mut matrix: DataMatrix) -> Result<(), MergeError> {
        matrix.sort_by_time();
        let Some(incoming) = Fragment::new(matrix) else {
            return Ok(());
        };
        if let Some(existing) = &self.series {
            check_combinable(existing, &incoming)?;
        }
        self.series = Some(match self.series.take() {
            Some(existing) => combine(existing, incoming)?,
            None => incoming,
        });
        Ok(())
    }

    /// Current `(start, end)` of the assembled series.
    pub fn span(&self) -> Option<(f64, f64)> {
        self.series.as_ref().map(|f| (f.start, f.end))
    }

    pub fn finish(self) -> Option<DataMatrix> {
        self.series.map(Fragment::into_matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(times: impl IntoIterator<Item = i32>, tag: f64) -> DataMatrix {
        DataMatrix::from_rows(times.into_iter().map(|t| vec![t as f64, tag]).collect()).unwrap()
    }

    fn fragment(times: impl IntoIterator<Item = i32>, tag: f64) -> Fragment {
        Fragment::new(series(times, tag)).unwrap()
    }

    #[test]
    fn test_binary_search_bounds() {
        let m = series([0, 2, 4, 6], 0.0);
        assert_eq!(find_index_at_or_after(&m, 3.0), Some(2));
        assert_eq!(find_index_at_or_after(&m, 4.0), Some(2));
        assert_eq!(find_index_at_or_after(&m, 7.0), None);
        assert_eq!(find_index_at_or_before(&m, 3.0), Some(1));
        assert_eq!(find_index_at_or_before(&m, 6.0), Some(3));
        assert_eq!(find_index_at_or_before(&m, -1.0), None);
    }

    #[test]
    fn test_subset() {
        let m = series(0..10, 1.0);
        let s = subset(&m, 2.5, 5.0).unwrap();
        assert_eq!(s.column_values(0).unwrap(), vec![3.0, 4.0, 5.0]);
        assert!(subset(&m, 20.0, 30.0).is_none());
        assert!(subset(&m, 3.2, 3.8).is_none());
    }

    #[test]
    fn test_overlaps() {
        let a = fragment(0..=10, 0.0);
        assert!(a.overlaps(&fragment(10..=20, 0.0)));
        assert!(!a.overlaps(&fragment(11..=20, 0.0)));
    }

    #[test]
    fn test_combine_with_itself() {
        let a = fragment(0..10, 1.0);
        assert_eq!(combine(a.clone(), a.clone()).unwrap(), a);
    }

    #[test]
    fn test_combine_dominance() {
        let inner = fragment(3..6, 1.0);
        let outer = fragment(0..10, 2.0);
        assert_eq!(combine(inner.clone(), outer.clone()).unwrap(), outer);
        assert_eq!(combine(outer.clone(), inner).unwrap(), outer);
    }

    #[test]
    fn test_combine_adjacent() {
        let merged = combine(fragment(0..10, 1.0), fragment(10..20, 2.0)).unwrap();
        let times = merged.matrix().column_values(0).unwrap();
        assert_eq!(times, (0..20).map(f64::from).collect::<Vec<_>>());
        assert_eq!((merged.start(), merged.end()), (0.0, 19.0));
    }

    #[test]
    fn test_combine_overlap_keeps_existing_rows() {
        let merged = combine(fragment(0..=10, 1.0), fragment(10..=15, 2.0)).unwrap();
        let m = merged.matrix();
        assert_eq!(m.rows(), 16);
        let at_ten = find_index_at_or_after(m, 10.0).unwrap();
        assert_eq!(m.get(at_ten, 1), 1.0);
        assert_eq!(m.get(at_ten + 1, 1), 2.0);
    }

    #[test]
    fn test_combine_incoming_earlier() {
        let merged = combine(fragment(10..20, 1.0), fragment(5..12, 2.0)).unwrap();
        let m = merged.matrix();
        assert_eq!(m.column_values(0).unwrap(), (5..20).map(f64::from).collect::<Vec<_>>());
        assert_eq!(m.get(0, 1), 2.0);
        assert_eq!(m.get(m.rows() - 1, 1), 1.0);
    }

    #[test]
    fn test_combine_rejects_unordered_windows() {
        let a = fragment([1], 0.0);
        let nan = Fragment::new(DataMatrix::from_rows(vec![vec![f64::NAN, 0.0]]).unwrap()).unwrap();
        assert!(matches!(
            combine(a, nan),
            Err(MergeError::UnorderedWindows { .. })
        ));
    }

    #[test]
    fn test_assembler_keeps_series_after_failed_push() {
        let mut assembler = SeriesAssembler::new();
        assembler.push(series(0..10, 1.0)).unwrap();

        let nan = DataMatrix::from_rows(vec![vec![f64::NAN, 0.0]]).unwrap();
        assert!(matches!(
            assembler.push(nan),
            Err(MergeError::UnorderedWindows { .. })
        ));
        assert_eq!(assembler.span(), Some((0.0, 9.0)));

        let wide = DataMatrix::from_rows(vec![vec![20.0, 0.0, 0.0]]).unwrap();
        assert!(matches!(assembler.push(wide), Err(MergeError::Matrix(_))));
        assert_eq!(assembler.span(), Some((0.0, 9.0)));

        assembler.push(series(10..12, 2.0)).unwrap();
        assert_eq!(assembler.finish().unwrap().rows(), 12);
    }

    #[test]
    fn test_bias_helpers() {
        let mut m = DataMatrix::from_rows(
            (0..10).map(|t| vec![t as f64, 100.0 + t as f64]).collect(),
        )
        .unwrap();
        assert_eq!(bias_between(&m, 1, 0.0, 2.0).unwrap(), Some(101.0));
        assert_eq!(remove_bias(&mut m, 1, 0.0, 2.0).unwrap(), Some(101.0));
        assert_eq!(m.get(1, 1), 0.0);
        assert_eq!(remove_bias(&mut m, 1, 50.0, 60.0).unwrap(), None);
    }

    #[test]
    fn test_assembler_sorts_and_stitches() {
        let mut assembler = SeriesAssembler::new();
        assembler.push(series([12, 10, 11], 2.0)).unwrap();
        assembler.push(series(0..=10, 1.0)).unwrap();
        assembler.push(DataMatrix::new(2)).unwrap();
        assert_eq!(assembler.span(), Some((0.0, 12.0)));

        let m = assembler.finish().unwrap();
        assert_eq!(m.column_values(0).unwrap(), (0..=12).map(f64::from).collect::<Vec<_>>());
    }
}
