//! Precomputed per-user usage statistics.
//!
//! Upstream exports name aggregate columns either `avg(num_25)` or
//! `avg_num_25`; both are normalized to the underscore form on load.
//! Columns that are not usage aggregates (a stray label column, for example)
//! are dropped so they cannot collide with the base table in the join.

use std::path::Path;

use tracing::{info, warn};

use crate::schema::{usage_column_name, FeatureSchema, UsageAggregate};
use crate::table::{Table, TableError};

/// Canonical name of a usage column in either naming convention, or `None`
/// if the name is not `<aggregate>(<metric>)` / `<aggregate>_<metric>`.
pub fn canonical_usage_column(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Some((aggregate, rest)) = raw.split_once('(') {
        let metric = rest.strip_suffix(')')?;
        let aggregate = UsageAggregate::parse(aggregate.trim())?;
        let metric = metric.trim();
        if metric.is_empty() {
            return None;
        }
        return Some(usage_column_name(aggregate, metric));
    }

    let (aggregate, metric) = raw.split_once('_')?;
    let aggregate = UsageAggregate::parse(aggregate)?;
    if metric.is_empty() {
        return None;
    }
    Some(usage_column_name(aggregate, metric))
}

pub fn read_usage_statistics(path: &Path, schema: &FeatureSchema) -> Result<Table, TableError> {
    let raw = Table::read_csv(path, "usage_statistics", &[schema.key_column.as_str()])?;
    normalize_usage_columns(raw, schema)
}

pub fn normalize_usage_columns(
    mut table: Table,
    schema: &FeatureSchema,
) -> Result<Table, TableError> {
    table.require_column(&schema.key_column)?;
    let expected = schema.usage_columns();

    let original: Vec<String> = table.columns().to_vec();
    let mut renamed = 0;
    for column in original {
        if column == schema.key_column {
            continue;
        }
        match canonical_usage_column(&column) {
            Some(canonical) if expected.contains(&canonical) => {
                if canonical != column {
                    table.rename_column(&column, &canonical)?;
                    renamed += 1;
                }
            }
            _ => {
                table.drop_column(&column);
                warn!(
                    component = "usage",
                    event = "usage.column.dropped",
                    column = %column
                );
            }
        }
    }

    for column in &expected {
        table.require_column(column)?;
    }

    info!(
        component = "usage",
        event = "usage.normalized",
        rows = table.row_count(),
        columns = expected.len(),
        renamed
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{build_feature_schema, SchemaConfig, USAGE_METRICS};

    fn header(style: fn(&str, &str) -> String, aggregates: &[&str]) -> String {
        let mut columns = vec!["msno".to_string()];
        for agg in aggregates {
            for metric in USAGE_METRICS {
                columns.push(style(agg, metric));
            }
        }
        columns.join(",")
    }

    fn row(width: usize) -> String {
        let mut cells = vec!["u1".to_string()];
        cells.extend((1..width).map(|v| v.to_string()));
        cells.join(",")
    }

    #[test]
    fn canonical_names_from_both_conventions() {
        assert_eq!(
            canonical_usage_column("avg(num_25)").as_deref(),
            Some("avg_num_25")
        );
        assert_eq!(
            canonical_usage_column("stddev_total_secs").as_deref(),
            Some("stddev_total_secs")
        );
        assert_eq!(canonical_usage_column("is_churn"), None);
        assert_eq!(canonical_usage_column("msno"), None);
        assert_eq!(canonical_usage_column("median(num_25)"), None);
        assert_eq!(canonical_usage_column("avg("), None);
    }

    #[test]
    fn paren_style_is_renamed_and_label_dropped() {
        let schema = build_feature_schema(&SchemaConfig::default());
        let mut head = header(|a, m| format!("{a}({m})"), &["avg", "min", "max", "sum", "stddev"]);
        head.push_str(",is_churn");
        let width = 1 + 35 + 1;
        let body = format!("{head}\n{}\n", row(width));

        let raw = Table::from_reader(body.as_bytes(), "usage", &["msno"]).unwrap();
        let table = normalize_usage_columns(raw, &schema).unwrap();

        assert!(!table.has_column("is_churn"));
        assert!(table.has_column("avg_num_25"));
        assert!(table.has_column("stddev_num_100"));
        assert_eq!(table.columns().len(), 36);
    }

    #[test]
    fn missing_aggregate_is_schema_error() {
        let schema = build_feature_schema(&SchemaConfig::default());
        let head = header(|a, m| format!("{a}_{m}"), &["avg", "min", "max", "sum"]);
        let body = format!("{head}\n{}\n", row(29));

        let raw = Table::from_reader(body.as_bytes(), "usage", &["msno"]).unwrap();
        let err = normalize_usage_columns(raw, &schema).unwrap_err();
        assert!(matches!(err, TableError::MissingColumn { ref column, .. } if column == "stddev_num_unq"));
    }

    #[test]
    fn stddev_columns_are_dropped_when_schema_excludes_them() {
        let schema = build_feature_schema(&SchemaConfig {
            include_stddev: false,
            ..SchemaConfig::default()
        });
        let head = header(|a, m| format!("{a}_{m}"), &["avg", "min", "max", "sum", "stddev"]);
        let body = format!("{head}\n{}\n", row(36));

        let raw = Table::from_reader(body.as_bytes(), "usage", &["msno"]).unwrap();
        let table = normalize_usage_columns(raw, &schema).unwrap();
        assert!(!table.has_column("stddev_num_25"));
        assert_eq!(table.columns().len(), 29);
    }
}
