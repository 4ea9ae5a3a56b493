//! Row-wise conversion of feature-table rows into namespaced learner records.
//!
//! A record carries an optional `_label` slot and one sub-map per schema
//! group, keyed by the group's namespace. Columns are classified by exact
//! membership in the schema; anything else is dropped after a diagnostic.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::category::CategoryValue;
use crate::schema::{ColumnCoverage, FeatureGroup, FeatureSchema};

pub const DEFAULT_PROGRESS_EVERY: u64 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmappedColumnPolicy {
    /// Drop the column after a `warn` event.
    Warn,
    /// Refuse to encode a table with unmapped columns.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub unmapped: UnmappedColumnPolicy,
    pub progress_every: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            unmapped: UnmappedColumnPolicy::Warn,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Categorical(String),
    Numeric(f64),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct EncodedRecord {
    #[serde(rename = "_label", skip_serializing_if = "Option::is_none")]
    pub label: Option<i8>,
    #[serde(flatten)]
    pub namespaces: BTreeMap<&'static str, BTreeMap<String, FeatureValue>>,
}

impl EncodedRecord {
    pub fn group(&self, group: FeatureGroup) -> Option<&BTreeMap<String, FeatureValue>> {
        self.namespaces.get(group.namespace())
    }

    pub fn feature_count(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncodeReport {
    pub rows: u64,
    pub labeled_rows: u64,
    pub unmapped_columns: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("input file not found: {path}")]
    MissingInput { path: PathBuf },
    #[error("column '{column}' has non-numeric value '{value}'")]
    InvalidNumber { column: String, value: String },
    #[error("column '{column}' has non-finite value {value}")]
    NonFinite { column: String, value: f64 },
    #[error("label column '{column}' has invalid value '{value}'")]
    InvalidLabel { column: String, value: String },
    #[error("columns not covered by the feature schema: {columns:?}")]
    Unmapped { columns: Vec<String> },
    #[error("row {row}: {source}")]
    AtRow {
        row: u64,
        #[source]
        source: Box<EncodeError>,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct RecordEncoder<'a> {
    schema: &'a FeatureSchema,
    config: EncoderConfig,
}

impl<'a> RecordEncoder<'a> {
    pub fn new(schema: &'a FeatureSchema, config: EncoderConfig) -> Self {
        Self { schema, config }
    }

    pub fn schema(&self) -> &FeatureSchema {
        self.schema
    }

    /// Reports each unmapped non-key column once. Under
    /// [`UnmappedColumnPolicy::Reject`] any unmapped column is an error.
    pub fn check_columns<I, S>(&self, columns: I) -> Result<ColumnCoverage, EncodeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let coverage = self.schema.check_columns(columns);
        for column in &coverage.unmapped {
            warn!(
                component = "encoder",
                event = "records.encode.unmapped_column",
                column = %column,
                policy = ?self.config.unmapped
            );
        }
        if self.config.unmapped == UnmappedColumnPolicy::Reject && !coverage.unmapped.is_empty() {
            return Err(EncodeError::Unmapped {
                columns: coverage.unmapped,
            });
        }
        Ok(coverage)
    }

    pub fn encode_row(&self, row: &HashMap<String, String>) -> Result<EncodedRecord, EncodeError> {
        self.encode_fields(row.iter().map(|(column, value)| (column.as_str(), value.as_str())))
    }

    /// Encodes one row given as `(column, raw value)` pairs. Every declared
    /// group is present in the output, even when empty.
    pub fn encode_fields<'r, I>(&self, fields: I) -> Result<EncodedRecord, EncodeError>
    where
        I: IntoIterator<Item = (&'r str, &'r str)>,
    {
        let mut record = EncodedRecord::default();
        for group in self.schema.groups() {
            record.namespaces.insert(group.namespace(), BTreeMap::new());
        }

        for (column, raw) in fields {
            if column == self.schema.label_column {
                record.label = parse_label(column, raw)?;
                continue;
            }
            if column == self.schema.key_column {
                continue;
            }
            let Some(group) = self.schema.group_of(column) else {
                debug!(
                    component = "encoder",
                    event = "records.encode.dropped_column",
                    column
                );
                continue;
            };

            let value = if group.is_categorical() {
                FeatureValue::Categorical(CategoryValue::parse(raw).to_string())
            } else {
                FeatureValue::Numeric(parse_numeric(column, raw)?)
            };
            record
                .namespaces
                .entry(group.namespace())
                .or_default()
                .insert(column.to_string(), value);
        }

        Ok(record)
    }
}

/// 0 maps to -1, any other number to +1. An empty cell means the row is
/// unlabeled.
fn parse_label(column: &str, raw: &str) -> Result<Option<i8>, EncodeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(if value == 0.0 { -1 } else { 1 })),
        _ => Err(EncodeError::InvalidLabel {
            column: column.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_numeric(column: &str, raw: &str) -> Result<f64, EncodeError> {
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| EncodeError::InvalidNumber {
            column: column.to_string(),
            value: raw.to_string(),
        })?;
    if !value.is_finite() {
        return Err(EncodeError::NonFinite {
            column: column.to_string(),
            value,
        });
    }
    Ok(value)
}

/// Streams a feature-table CSV into JSON lines, one record per row.
pub fn encode_records<R: Read, W: Write>(
    input: R,
    mut output: W,
    encoder: &RecordEncoder<'_>,
) -> Result<EncodeReport, EncodeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input);
    let headers = reader.headers()?.clone();
    let coverage = encoder.check_columns(headers.iter())?;

    let mut report = EncodeReport {
        unmapped_columns: coverage.unmapped,
        ..EncodeReport::default()
    };
    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record)? {
        let row = report.rows;
        let encoded = encoder
            .encode_fields(headers.iter().zip(record.iter()))
            .map_err(|source| EncodeError::AtRow {
                row,
                source: Box::new(source),
            })?;
        serde_json::to_writer(&mut output, &encoded)?;
        output.write_all(b"\n")?;

        report.rows += 1;
        if encoded.label.is_some() {
            report.labeled_rows += 1;
        }
        let every = encoder.config.progress_every;
        if every > 0 && report.rows % every == 0 {
            info!(
                component = "encoder",
                event = "records.encode.progress",
                rows = report.rows
            );
        }
    }
    output.flush()?;

    info!(
        component = "encoder",
        event = "records.encode.finish",
        rows = report.rows,
        labeled_rows = report.labeled_rows,
        unmapped_columns = report.unmapped_columns.len()
    );
    Ok(report)
}

/// File-to-file variant of [`encode_records`]. Output goes to a sibling temp
/// file that replaces `output` only after the last row is written.
pub fn write_encoded_records(
    input: &Path,
    output: &Path,
    encoder: &RecordEncoder<'_>,
) -> Result<EncodeReport, EncodeError> {
    if !input.is_file() {
        return Err(EncodeError::MissingInput {
            path: input.to_path_buf(),
        });
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = output
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", output.display()),
            )
        })?;
    let tmp_path = output.with_file_name(format!("{file_name}.tmp"));

    info!(
        component = "encoder",
        event = "records.encode.start",
        input = %input.display(),
        output = %output.display()
    );
    let result = (|| -> Result<EncodeReport, EncodeError> {
        let mut writer = BufWriter::new(fs::File::create(&tmp_path)?);
        let report = encode_records(fs::File::open(input)?, &mut writer, encoder)?;
        writer.into_inner().map_err(|err| err.into_error())?.sync_all()?;
        Ok(report)
    })();

    match result {
        Ok(report) => {
            fs::rename(&tmp_path, output)?;
            Ok(report)
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp_path);
            Err(err)
        }
    }
}
