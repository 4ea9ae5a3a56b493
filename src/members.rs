//! Member attribute ingestion: categorical normalization and age censoring.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::info;

use crate::category::{normalize_categories, normalize_table_column, CategoryValue};
use crate::schema::FeatureSchema;
use crate::table::{Cell, Table, TableError};

pub const AGE_COLUMN: &str = "age";
pub const RAW_AGE_COLUMN: &str = "bd";
pub const MIN_AGE: f64 = 0.0;
pub const MAX_AGE: f64 = 100.0;

pub fn read_members(path: &Path, schema: &FeatureSchema) -> Result<Table, TableError> {
    let raw = Table::read_csv(path, "members", &[schema.key_column.as_str()])?;
    normalize_members(raw, schema)
}

/// Renames the raw age column, normalizes every categorical column declared
/// by the null policy and clips observed ages to [0, 100].
pub fn normalize_members(mut table: Table, schema: &FeatureSchema) -> Result<Table, TableError> {
    table.require_column(&schema.key_column)?;
    if !table.has_column(AGE_COLUMN) && table.has_column(RAW_AGE_COLUMN) {
        table.rename_column(RAW_AGE_COLUMN, AGE_COLUMN)?;
    }
    table.require_column(AGE_COLUMN)?;

    for (column, substitute) in schema.null_policy.categorical_columns() {
        let categories = normalize_table_column(&mut table, column, substitute)?;
        info!(
            component = "members",
            event = "members.category.normalized",
            column,
            categories = categories.len()
        );
    }

    let clipped = clip_column(&mut table, AGE_COLUMN, MIN_AGE, MAX_AGE)?;
    info!(
        component = "members",
        event = "members.normalized",
        rows = table.row_count(),
        ages_clipped = clipped
    );
    Ok(table)
}

/// Domain of each categorical member column: its distinct values plus the
/// null substitute. Taken over the whole members table, not one population.
pub fn category_domains(
    members: &Table,
    schema: &FeatureSchema,
) -> Result<Vec<(String, BTreeSet<CategoryValue>)>, TableError> {
    schema
        .null_policy
        .categorical_columns()
        .map(|(column, substitute)| {
            let cells = members.column_cells(column)?;
            let domain = normalize_categories(&cells, substitute).categories;
            Ok((column.to_string(), domain))
        })
        .collect()
}

/// Clips observed numeric values of `column` into `[min, max]`; missing cells
/// stay missing. Returns the number of clipped cells.
pub fn clip_column(
    table: &mut Table,
    column: &str,
    min: f64,
    max: f64,
) -> Result<usize, TableError> {
    let cells = table.column_cells(column)?;
    let mut clipped = 0;
    let mut out = Vec::with_capacity(cells.len());
    for (row, cell) in cells.into_iter().enumerate() {
        match cell {
            Cell::Missing => out.push(Cell::Missing),
            Cell::Number(value) => {
                let bounded = value.clamp(min, max);
                if bounded != value {
                    clipped += 1;
                }
                out.push(Cell::Number(bounded));
            }
            Cell::Text(value) => {
                return Err(TableError::NonNumeric {
                    table: table.name().to_string(),
                    column: column.to_string(),
                    row,
                    value,
                })
            }
        }
    }
    table.replace_column(column, out)?;
    Ok(clipped)
}
