use super::{action, DataSource, SourceData, SourceError, SourceOptions, Window};
use crate::matrix::codec::Layout;
use crate::matrix::merge::locate;
use crate::matrix::{DataMatrix, NO_DATA};
use crate::protocol::RequestParams;
use std::path::Path;
use tracing::info;

pub const KIND: &str = "memory";

/// A fixed matrix held in memory, served by window.
#[derive(Debug, Clone)]
pub struct MemorySource {
    kind: String,
    description: String,
    layout: Layout,
    matrix: DataMatrix,
}

impl MemorySource {
    pub fn new(kind: impl Into<String>, description: impl Into<String>, mut matrix: DataMatrix) -> Self {
        matrix.sort_by_time();
        MemorySource {
            kind: kind.into(),
            description: description.into(),
            layout: Layout::Explicit,
            matrix,
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Kind reported for a configured source: option `type`, else `memory`.
    pub fn reported_kind(name: &str, table: &toml::Table) -> Result<String, SourceError> {
        let options = SourceOptions::new(name, table);
        Ok(options.str("type")?.unwrap_or(KIND).to_string())
    }

    /// Options: `path` (CSV, required), `type` (reported kind), `layout`.
    pub fn from_options(name: &str, description: &str, table: &toml::Table) -> Result<Self, SourceError> {
        let options = SourceOptions::new(name, table);
        let path = options.str("path")?.ok_or_else(|| SourceError::InvalidOption {
            name: name.to_string(),
            key: "path".to_string(),
            message: "required".to_string(),
        })?;
        let layout = match options.str("layout")? {
            None | Some("explicit") => Layout::Explicit,
            Some("legacy") => Layout::Legacy,
            Some(other) => {
                return Err(SourceError::InvalidOption {
                    name: name.to_string(),
                    key: "layout".to_string(),
                    message: format!("unknown layout '{}'", other),
                })
            }
        };
        let matrix = load_csv(Path::new(path))?;
        info!(source = %name, path = %path, rows = matrix.rows(), "Loaded memory source");
        let kind = Self::reported_kind(name, table)?;
        Ok(MemorySource::new(kind, description, matrix).with_layout(layout))
    }

    pub fn matrix(&self) -> &DataMatrix {
        &self.matrix
    }

    fn window_rows(&self, window: &Window) -> DataMatrix {
        match locate(&self.matrix, window.start, window.end) {
            Some(range) => self.matrix.slice_rows(*range.start()..*range.end() + 1),
            None => self.matrix.slice_rows(0..0),
        }
    }
}

impl DataSource for MemorySource {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn layout(&self) -> Layout {
        self.layout
    }

    fn count_rows(&self, params: &RequestParams, window: &Window) -> Option<usize> {
        if action(params) != "data" {
            return None;
        }
        Some(locate(&self.matrix, window.start, window.end).map_or(0, |r| r.count()))
    }

    fn get_data(&self, params: &RequestParams, window: &Window) -> Result<SourceData, SourceError> {
        match action(params) {
            "data" => Ok(SourceData::Matrix(self.window_rows(window))),
            "columns" => Ok(SourceData::Lines(
                self.matrix.column_names().into_iter().map(String::from).collect(),
            )),
            other => Err(SourceError::UnsupportedAction(other.to_string())),
        }
    }
}

fn parse_cell(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return Some(NO_DATA);
    }
    cell.parse().ok()
}

/// Parse comma-separated rows with j2ksec in the first column. A first line
/// that is not numeric is taken as column names; `#` lines are comments.
pub fn parse_csv(text: &str) -> Result<DataMatrix, SourceError> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .peekable();

    let mut names: Option<Vec<String>> = None;
    if let Some((_, first)) = lines.peek() {
        if first.split(',').any(|c| parse_cell(c).is_none()) {
            names = Some(first.split(',').map(|c| c.trim().to_string()).collect());
            lines.next();
        }
    }

    let mut rows = Vec::new();
    for (number, line) in lines {
        let row = line
            .split(',')
            .map(parse_cell)
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| SourceError::Adapter(format!("line {}: not numeric", number + 1)))?;
        rows.push(row);
    }

    let columns = names
        .as_ref()
        .map(Vec::len)
        .or_else(|| rows.first().map(Vec::len))
        .unwrap_or(1);
    let mut matrix = DataMatrix::new(columns);
    for row in &rows {
        matrix
            .push_row(row)
            .map_err(|e| SourceError::Adapter(e.to_string()))?;
    }
    if let Some(names) = names {
        matrix
            .set_column_names(&names)
            .map_err(|e| SourceError::Adapter(e.to_string()))?;
    }
    Ok(matrix)
}

pub fn load_csv(path: &Path) -> Result<DataMatrix, SourceError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| SourceError::Adapter(format!("{}: {}", path.display(), e)))?;
    parse_csv(&text)
}
