//! Row-major in-memory tables loaded from CSV.
//!
//! Cells are nullable and loosely typed: anything that parses as a finite
//! number becomes [`Cell::Number`], empty/`nan` becomes [`Cell::Missing`],
//! everything else stays text. Columns named as text columns at load time are
//! kept verbatim so opaque identifiers never lose leading zeros.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Missing,
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if is_null_token(trimmed) {
            return Self::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => Self::Number(value),
            _ => Self::Text(trimmed.to_string()),
        }
    }

    fn parse_verbatim(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Self::Missing
        } else {
            Self::Text(trimmed.to_string())
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Join-key form of the cell; `None` for missing cells, which never match.
    pub fn key_string(&self) -> Option<String> {
        match self {
            Self::Missing => None,
            Self::Number(value) => Some(format_number(*value)),
            Self::Text(text) => Some(text.clone()),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Missing => String::new(),
            Self::Number(value) => format_number(*value),
            Self::Text(text) => text.clone(),
        }
    }
}

/// Integral values print without a fractional part so `1.0` and `1` render
/// identically; everything else uses the shortest round-tripping form.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn is_null_token(raw: &str) -> bool {
    raw.is_empty() || raw.eq_ignore_ascii_case("nan") || raw.eq_ignore_ascii_case("null")
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("missing input for {table}: {path}")]
    MissingInput { table: String, path: PathBuf },
    #[error("table {table} has no column '{column}'")]
    MissingColumn { table: String, column: String },
    #[error("column '{column}' already exists in table {table}")]
    DuplicateColumn { table: String, column: String },
    #[error("column '{column}' exists in both {left} and {right}")]
    ColumnCollision {
        left: String,
        right: String,
        column: String,
    },
    #[error("duplicate key '{key}' in table {table}")]
    DuplicateKey { table: String, key: String },
    #[error("row {row} of {table} has {found} cells, expected {expected}")]
    RowWidth {
        table: String,
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("column '{column}' of {table} has {found} cells, expected {expected}")]
    ColumnLength {
        table: String,
        column: String,
        found: usize,
        expected: usize,
    },
    #[error("non-numeric value '{value}' in {table}.{column} at row {row}")]
    NonNumeric {
        table: String,
        column: String,
        row: usize,
        value: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn read_csv(path: &Path, name: &str, text_columns: &[&str]) -> Result<Self, TableError> {
        if !path.is_file() {
            return Err(TableError::MissingInput {
                table: name.to_string(),
                path: path.to_path_buf(),
            });
        }

        let file = fs::File::open(path)?;
        let table = Self::from_reader(file, name, text_columns)?;
        info!(
            component = "table",
            event = "table.read",
            table = name,
            path = %path.display(),
            rows = table.row_count(),
            columns = table.columns.len()
        );
        Ok(table)
    }

    pub fn from_reader<R: Read>(
        reader: R,
        name: &str,
        text_columns: &[&str],
    ) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);
        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|header| header.trim().to_string())
            .collect();
        let verbatim: Vec<bool> = columns
            .iter()
            .map(|column| text_columns.contains(&column.as_str()))
            .collect();

        let mut table = Self::new(name, columns);
        for record in reader.records() {
            let record = record?;
            table.rows.push(parse_record(&record, &verbatim));
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    pub fn require_column(&self, column: &str) -> Result<usize, TableError> {
        self.column_index(column)
            .ok_or_else(|| TableError::MissingColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                table: self.name.clone(),
                row: self.rows.len(),
                found: row.len(),
                expected: self.columns.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|cells| &cells[idx])
    }

    pub fn column_cells(&self, column: &str) -> Result<Vec<Cell>, TableError> {
        let idx = self.require_column(column)?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    pub fn replace_column(&mut self, column: &str, cells: Vec<Cell>) -> Result<(), TableError> {
        let idx = self.require_column(column)?;
        if cells.len() != self.rows.len() {
            return Err(TableError::ColumnLength {
                table: self.name.clone(),
                column: column.to_string(),
                found: cells.len(),
                expected: self.rows.len(),
            });
        }
        for (row, cell) in self.rows.iter_mut().zip(cells) {
            row[idx] = cell;
        }
        Ok(())
    }

    pub fn add_column(&mut self, column: &str, cells: Vec<Cell>) -> Result<(), TableError> {
        if self.has_column(column) {
            return Err(TableError::DuplicateColumn {
                table: self.name.clone(),
                column: column.to_string(),
            });
        }
        if cells.len() != self.rows.len() {
            return Err(TableError::ColumnLength {
                table: self.name.clone(),
                column: column.to_string(),
                found: cells.len(),
                expected: self.rows.len(),
            });
        }
        self.columns.push(column.to_string());
        for (row, cell) in self.rows.iter_mut().zip(cells) {
            row.push(cell);
        }
        Ok(())
    }

    /// Returns whether the column was present.
    pub fn drop_column(&mut self, column: &str) -> bool {
        let Some(idx) = self.column_index(column) else {
            return false;
        };
        self.columns.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        true
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<(), TableError> {
        if from == to {
            return Ok(());
        }
        if self.has_column(to) {
            return Err(TableError::DuplicateColumn {
                table: self.name.clone(),
                column: to.to_string(),
            });
        }
        let idx = self.require_column(from)?;
        self.columns[idx] = to.to_string();
        Ok(())
    }

    /// Replaces missing cells of `column` with `value`; returns the number filled.
    pub fn fill_missing(&mut self, column: &str, value: &Cell) -> Result<usize, TableError> {
        let idx = self.require_column(column)?;
        let mut filled = 0;
        for row in &mut self.rows {
            if row[idx].is_missing() {
                row[idx] = value.clone();
                filled += 1;
            }
        }
        Ok(filled)
    }

    pub fn missing_count(&self, column: &str) -> Result<usize, TableError> {
        let idx = self.require_column(column)?;
        Ok(self.rows.iter().filter(|row| row[idx].is_missing()).count())
    }

    pub fn columns_with_missing(&self) -> Vec<String> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.rows.iter().any(|row| row[*idx].is_missing()))
            .map(|(_, column)| column.clone())
            .collect()
    }

    /// Ordered, de-duplicated key values of `column`, skipping missing cells.
    pub fn distinct_keys(&self, column: &str) -> Result<Vec<String>, TableError> {
        let idx = self.require_column(column)?;
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for row in &self.rows {
            if let Some(key) = row[idx].key_string() {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Left join on `key`, keeping every row of `self` in order. Right-side
    /// keys must be unique; unmatched rows get missing cells for every
    /// right-hand column.
    pub fn left_join(&self, right: &Table, key: &str) -> Result<JoinOutcome, TableError> {
        let left_key = self.require_column(key)?;
        let right_key = right.require_column(key)?;
        let right_index = right.unique_key_index(right_key)?;

        let carried: Vec<usize> = (0..right.columns.len())
            .filter(|idx| *idx != right_key)
            .collect();
        for &idx in &carried {
            if self.has_column(&right.columns[idx]) {
                return Err(TableError::ColumnCollision {
                    left: self.name.clone(),
                    right: right.name.clone(),
                    column: right.columns[idx].clone(),
                });
            }
        }

        let mut columns = self.columns.clone();
        columns.extend(carried.iter().map(|&idx| right.columns[idx].clone()));

        let mut matched_rows = 0;
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let hit = row[left_key]
                .key_string()
                .and_then(|k| right_index.get(&k).copied());
            let mut out = Vec::with_capacity(columns.len());
            out.extend(row.iter().cloned());
            match hit {
                Some(right_row) => {
                    matched_rows += 1;
                    out.extend(
                        carried
                            .iter()
                            .map(|&idx| right.rows[right_row][idx].clone()),
                    );
                }
                None => out.extend(std::iter::repeat(Cell::Missing).take(carried.len())),
            }
            rows.push(out);
        }

        debug!(
            component = "table",
            event = "table.left_join",
            left = %self.name,
            right = %right.name,
            key,
            left_rows = self.rows.len(),
            matched_rows
        );

        Ok(JoinOutcome {
            table: Table {
                name: self.name.clone(),
                columns,
                rows,
            },
            matched_rows,
        })
    }

    fn unique_key_index(&self, key_idx: usize) -> Result<HashMap<String, usize>, TableError> {
        let mut index = HashMap::with_capacity(self.rows.len());
        for (row_idx, row) in self.rows.iter().enumerate() {
            let Some(key) = row[key_idx].key_string() else {
                continue;
            };
            if index.insert(key.clone(), row_idx).is_some() {
                return Err(TableError::DuplicateKey {
                    table: self.name.clone(),
                    key,
                });
            }
        }
        Ok(index)
    }

    pub fn write_csv_to<W: Write>(&self, writer: W) -> Result<(), TableError> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(Cell::render))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), TableError> {
        let mut buf = Vec::new();
        self.write_csv_to(&mut buf)?;
        write_atomic(path, &buf)?;
        info!(
            component = "table",
            event = "table.write",
            table = %self.name,
            path = %path.display(),
            rows = self.rows.len(),
            columns = self.columns.len()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub table: Table,
    pub matched_rows: usize,
}

fn parse_record(record: &StringRecord, verbatim: &[bool]) -> Vec<Cell> {
    record
        .iter()
        .enumerate()
        .map(|(idx, raw)| {
            if verbatim.get(idx).copied().unwrap_or(false) {
                Cell::parse_verbatim(raw)
            } else {
                Cell::parse(raw)
            }
        })
        .collect()
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            )
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
