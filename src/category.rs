//! Closed categorical domains with an explicit null substitute, plus the
//! per-column null policy shared by normalization and the final fill pass.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::table::{format_number, Cell, Table, TableError};

/// A category value. Integer codes sort before labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CategoryValue {
    Code(i64),
    Label(String),
}

impl CategoryValue {
    /// Numeric text is canonicalized so `1`, `1.0` and ` 1 ` are one category.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(value) if is_code(value) => Self::Code(value as i64),
            _ => Self::Label(trimmed.to_string()),
        }
    }

    pub fn from_cell(cell: &Cell) -> Option<Self> {
        match cell {
            Cell::Missing => None,
            Cell::Number(value) if is_code(*value) => Some(Self::Code(*value as i64)),
            Cell::Number(value) => Some(Self::Label(format_number(*value))),
            Cell::Text(text) => Some(Self::parse(text)),
        }
    }

    pub fn to_cell(&self) -> Cell {
        match self {
            Self::Code(code) => Cell::Number(*code as f64),
            Self::Label(label) => Cell::Text(label.clone()),
        }
    }
}

impl fmt::Display for CategoryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "{code}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

fn is_code(value: f64) -> bool {
    value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoricalColumn {
    pub values: Vec<CategoryValue>,
    pub categories: BTreeSet<CategoryValue>,
    pub substituted: usize,
}

impl CategoricalColumn {
    pub fn to_cells(&self) -> Vec<Cell> {
        self.values.iter().map(CategoryValue::to_cell).collect()
    }
}

/// Every missing entry becomes `null_substitute`; the domain is the distinct
/// observed values plus the substitute, whether or not it was needed.
pub fn normalize_categories(raw: &[Cell], null_substitute: &CategoryValue) -> CategoricalColumn {
    let mut categories = BTreeSet::new();
    categories.insert(null_substitute.clone());
    let mut substituted = 0;

    let values = raw
        .iter()
        .map(|cell| match CategoryValue::from_cell(cell) {
            Some(value) => {
                categories.insert(value.clone());
                value
            }
            None => {
                substituted += 1;
                null_substitute.clone()
            }
        })
        .collect();

    CategoricalColumn {
        values,
        categories,
        substituted,
    }
}

/// Normalizes `column` of `table` in place and returns its category domain.
pub fn normalize_table_column(
    table: &mut Table,
    column: &str,
    null_substitute: &CategoryValue,
) -> Result<BTreeSet<CategoryValue>, TableError> {
    let normalized = normalize_categories(&table.column_cells(column)?, null_substitute);
    table.replace_column(column, normalized.to_cells())?;
    debug!(
        component = "category",
        event = "category.normalized",
        table = table.name(),
        column,
        categories = normalized.categories.len(),
        substituted = normalized.substituted
    );
    Ok(normalized.categories)
}

/// Replaces `column` with one 0/1 indicator column per category of
/// `domain`, named `<column>_<category>` and ordered by category. Every domain
/// value gets a column even when no row carries it; values outside the
/// domain still get one. Returns the new column names.
pub fn one_hot_encode(
    table: &mut Table,
    column: &str,
    domain: &BTreeSet<CategoryValue>,
) -> Result<Vec<String>, TableError> {
    let cells = table.column_cells(column)?;
    let values: Vec<Option<CategoryValue>> = cells.iter().map(CategoryValue::from_cell).collect();
    let mut categories: BTreeSet<&CategoryValue> = domain.iter().collect();
    let outside = values
        .iter()
        .flatten()
        .filter(|value| categories.insert(*value))
        .count();
    if outside > 0 {
        debug!(
            component = "category",
            event = "category.one_hot.outside_domain",
            table = table.name(),
            column,
            categories = outside
        );
    }

    let mut added = Vec::with_capacity(categories.len());
    for category in categories {
        let name = format!("{column}_{category}");
        let indicator = values
            .iter()
            .map(|value| {
                let hit = value.as_ref() == Some(category);
                Cell::Number(if hit { 1.0 } else { 0.0 })
            })
            .collect();
        table.add_column(&name, indicator)?;
        added.push(name);
    }
    table.drop_column(column);
    Ok(added)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NullSubstitute {
    Category(CategoryValue),
    Number(f64),
}

impl NullSubstitute {
    pub fn to_cell(&self) -> Cell {
        match self {
            Self::Category(value) => value.to_cell(),
            Self::Number(value) => Cell::Number(*value),
        }
    }
}

/// Column → substitute table. Columns without an entry fall back to 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullPolicy {
    entries: Vec<(String, NullSubstitute)>,
}

impl NullPolicy {
    pub fn new(entries: Vec<(String, NullSubstitute)>) -> Self {
        Self { entries }
    }

    pub fn member_defaults() -> Self {
        Self::new(vec![
            (
                "city".to_string(),
                NullSubstitute::Category(CategoryValue::Code(0)),
            ),
            (
                "gender".to_string(),
                NullSubstitute::Category(CategoryValue::Label("not_specified".to_string())),
            ),
            (
                "registered_via".to_string(),
                NullSubstitute::Category(CategoryValue::Code(0)),
            ),
            ("age".to_string(), NullSubstitute::Number(0.0)),
        ])
    }

    pub fn entries(&self) -> &[(String, NullSubstitute)] {
        &self.entries
    }

    pub fn substitute_for(&self, column: &str) -> Option<&NullSubstitute> {
        self.entries
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, substitute)| substitute)
    }

    pub fn fill_cell(&self, column: &str) -> Cell {
        self.substitute_for(column)
            .map(NullSubstitute::to_cell)
            .unwrap_or(Cell::Number(0.0))
    }

    pub fn categorical_columns(&self) -> impl Iterator<Item = (&str, &CategoryValue)> {
        self.entries.iter().filter_map(|(name, substitute)| match substitute {
            NullSubstitute::Category(value) => Some((name.as_str(), value)),
            NullSubstitute::Number(_) => None,
        })
    }
}

impl Default for NullPolicy {
    fn default() -> Self {
        Self::member_defaults()
    }
}
