//! Versioned feature schema: key/label columns, null policy, and the closed
//! partition of feature names into learner namespaces.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::category::{NullPolicy, NullSubstitute};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const USAGE_METRICS: [&str; 7] = [
    "num_unq",
    "total_secs",
    "num_25",
    "num_50",
    "num_75",
    "num_985",
    "num_100",
];

const BASIC_TRANSACTION_COLUMNS: [&str; 5] = [
    "num_transactions",
    "plan_net_worth",
    "mean_payment",
    "total_payments",
    "times_canceled",
];

const EXTENDED_TRANSACTION_COLUMNS: [&str; 11] = [
    "num_transactions",
    "plan_net_worth",
    "mean_payment",
    "total_payments",
    "times_canceled",
    "num_discounts",
    "total_discount",
    "mean_membership_duration",
    "total_membership_duration",
    "mean_amt_per_day",
    "total_amt_per_day",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeatureGroup {
    UserCategorical,
    NumericalNonUlog,
    AvgUlog,
    MinUlog,
    MaxUlog,
    SumUlog,
    StddevUlog,
}

impl FeatureGroup {
    pub fn name(self) -> &'static str {
        match self {
            Self::UserCategorical => "user_categorical",
            Self::NumericalNonUlog => "numerical_non_ulog",
            Self::AvgUlog => "avg_ulog",
            Self::MinUlog => "min_ulog",
            Self::MaxUlog => "max_ulog",
            Self::SumUlog => "sum_ulog",
            Self::StddevUlog => "stddev_ulog",
        }
    }

    /// Serialized namespace key. The learner keys namespaces by first
    /// character, so colliding groups carry a digit prefix.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::MaxUlog => "1max_ulog",
            Self::StddevUlog => "2stddev_ulog",
            other => other.name(),
        }
    }

    pub fn is_categorical(self) -> bool {
        matches!(self, Self::UserCategorical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageAggregate {
    Avg,
    Min,
    Max,
    Sum,
    Stddev,
}

impl UsageAggregate {
    pub const ALL: [UsageAggregate; 5] = [Self::Avg, Self::Min, Self::Max, Self::Sum, Self::Stddev];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Stddev => "stddev",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|agg| agg.as_str() == raw)
    }

    pub fn group(self) -> FeatureGroup {
        match self {
            Self::Avg => FeatureGroup::AvgUlog,
            Self::Min => FeatureGroup::MinUlog,
            Self::Max => FeatureGroup::MaxUlog,
            Self::Sum => FeatureGroup::SumUlog,
            Self::Stddev => FeatureGroup::StddevUlog,
        }
    }
}

/// Canonical usage column name (`avg_num_25`).
pub fn usage_column_name(aggregate: UsageAggregate, metric: &str) -> String {
    format!("{}_{metric}", aggregate.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionFeatureSet {
    Basic,
    Extended,
}

impl TransactionFeatureSet {
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Basic => &BASIC_TRANSACTION_COLUMNS,
            Self::Extended => &EXTENDED_TRANSACTION_COLUMNS,
        }
    }

    pub fn is_extended(self) -> bool {
        matches!(self, Self::Extended)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub version: u32,
    pub key_column: String,
    pub label_column: String,
    pub transaction_features: TransactionFeatureSet,
    pub include_stddev: bool,
    pub null_policy: NullPolicy,
    pub dropped_columns: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            version: FEATURE_SCHEMA_VERSION,
            key_column: "msno".to_string(),
            label_column: "is_churn".to_string(),
            transaction_features: TransactionFeatureSet::Extended,
            include_stddev: true,
            null_policy: NullPolicy::member_defaults(),
            dropped_columns: vec![
                "registration_init_time".to_string(),
                "expiration_date".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    pub group: FeatureGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub key_column: String,
    pub label_column: String,
    pub transaction_features: TransactionFeatureSet,
    pub usage_aggregates: Vec<UsageAggregate>,
    pub null_policy: NullPolicy,
    pub dropped_columns: Vec<String>,
    pub features: Vec<FeatureSpec>,
    #[serde(skip)]
    index: BTreeMap<String, FeatureGroup>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

/// Result of checking a column set against the schema partition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnCoverage {
    pub mapped: Vec<String>,
    pub unmapped: Vec<String>,
    pub has_label: bool,
}

impl FeatureSchema {
    pub fn group_of(&self, column: &str) -> Option<FeatureGroup> {
        self.index.get(column).copied()
    }

    /// Groups declared by this schema, in namespace order.
    pub fn groups(&self) -> Vec<FeatureGroup> {
        let mut groups = vec![
            FeatureGroup::UserCategorical,
            FeatureGroup::NumericalNonUlog,
        ];
        groups.extend(self.usage_aggregates.iter().map(|agg| agg.group()));
        groups
    }

    pub fn columns_in(&self, group: FeatureGroup) -> impl Iterator<Item = &str> {
        self.features
            .iter()
            .filter(move |spec| spec.group == group)
            .map(|spec| spec.name.as_str())
    }

    pub fn usage_columns(&self) -> Vec<String> {
        self.usage_aggregates
            .iter()
            .flat_map(|agg| {
                USAGE_METRICS
                    .iter()
                    .map(move |metric| usage_column_name(*agg, metric))
            })
            .collect()
    }

    pub fn is_identifier(&self, column: &str) -> bool {
        column == self.key_column || column == self.label_column
    }

    /// Splits `columns` into schema-mapped and unmapped names. The key and
    /// label columns are neither.
    pub fn check_columns<I, S>(&self, columns: I) -> ColumnCoverage
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut coverage = ColumnCoverage::default();
        for column in columns {
            let column = column.as_ref();
            if column == self.label_column {
                coverage.has_label = true;
            } else if column == self.key_column {
                continue;
            } else if self.index.contains_key(column) {
                coverage.mapped.push(column.to_string());
            } else {
                coverage.unmapped.push(column.to_string());
            }
        }
        coverage
    }
}

pub fn build_feature_schema(cfg: &SchemaConfig) -> FeatureSchema {
    let mut features = Vec::new();

    for (column, _) in cfg.null_policy.categorical_columns() {
        features.push(FeatureSpec {
            name: column.to_string(),
            group: FeatureGroup::UserCategorical,
        });
    }

    for (column, substitute) in cfg.null_policy.entries() {
        if matches!(substitute, NullSubstitute::Number(_)) {
            features.push(FeatureSpec {
                name: column.clone(),
                group: FeatureGroup::NumericalNonUlog,
            });
        }
    }
    for column in cfg.transaction_features.columns() {
        features.push(FeatureSpec {
            name: column.to_string(),
            group: FeatureGroup::NumericalNonUlog,
        });
    }

    let usage_aggregates: Vec<UsageAggregate> = UsageAggregate::ALL
        .into_iter()
        .filter(|agg| cfg.include_stddev || *agg != UsageAggregate::Stddev)
        .collect();
    for aggregate in &usage_aggregates {
        for metric in USAGE_METRICS {
            features.push(FeatureSpec {
                name: usage_column_name(*aggregate, metric),
                group: aggregate.group(),
            });
        }
    }

    let index = features
        .iter()
        .map(|spec| (spec.name.clone(), spec.group))
        .collect();
    let fingerprint = schema_fingerprint(cfg, &features);

    info!(
        component = "schema",
        event = "schema.built",
        version = cfg.version,
        transaction_features = ?cfg.transaction_features,
        include_stddev = cfg.include_stddev,
        feature_count = features.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.version,
        fingerprint,
        key_column: cfg.key_column.clone(),
        label_column: cfg.label_column.clone(),
        transaction_features: cfg.transaction_features,
        usage_aggregates,
        null_policy: cfg.null_policy.clone(),
        dropped_columns: cfg.dropped_columns.clone(),
        features,
        index,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), SchemaError> {
    if expected_version != actual.version {
        return Err(SchemaError::VersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(SchemaError::FingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn schema_fingerprint(cfg: &SchemaConfig, features: &[FeatureSpec]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.version));
    hasher.update(format!("key:{};label:{};", cfg.key_column, cfg.label_column));
    hasher.update("null_policy:");
    for (column, substitute) in cfg.null_policy.entries() {
        let rendered = match substitute {
            NullSubstitute::Category(value) => format!("category={value}"),
            NullSubstitute::Number(value) => format!("number={value}"),
        };
        hasher.update(format!("{column}={rendered},"));
    }
    hasher.update(";dropped:");
    for column in &cfg.dropped_columns {
        hasher.update(format!("{column},"));
    }
    hasher.update(";features:");
    for spec in features {
        hasher.update(spec.name.as_bytes());
        hasher.update(format!(":{};", spec.group.name()));
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn default_schema_partitions_every_feature_once() {
        let schema = build_feature_schema(&SchemaConfig::default());

        assert_eq!(schema.features.len(), 3 + 1 + 11 + 5 * 7);
        assert_eq!(schema.group_of("city"), Some(FeatureGroup::UserCategorical));
        assert_eq!(schema.group_of("age"), Some(FeatureGroup::NumericalNonUlog));
        assert_eq!(
            schema.group_of("mean_amt_per_day"),
            Some(FeatureGroup::NumericalNonUlog)
        );
        assert_eq!(schema.group_of("max_num_985"), Some(FeatureGroup::MaxUlog));
        assert_eq!(
            schema.group_of("stddev_total_secs"),
            Some(FeatureGroup::StddevUlog)
        );
        assert_eq!(schema.group_of("msno"), None);
        assert_eq!(schema.groups().len(), 7);
    }

    #[test]
    fn basic_variant_without_stddev() {
        let cfg = SchemaConfig {
            transaction_features: TransactionFeatureSet::Basic,
            include_stddev: false,
            ..SchemaConfig::default()
        };
        let schema = build_feature_schema(&cfg);

        assert_eq!(schema.groups().len(), 6);
        assert_eq!(schema.group_of("stddev_num_25"), None);
        assert_eq!(schema.group_of("total_discount"), None);
        assert_eq!(schema.usage_columns().len(), 28);
        assert_eq!(
            schema.columns_in(FeatureGroup::NumericalNonUlog).count(),
            1 + 5
        );
    }

    #[test]
    fn fingerprint_is_deterministic_and_variant_sensitive() {
        let a = build_feature_schema(&SchemaConfig::default());
        let b = build_feature_schema(&SchemaConfig::default());
        let c = build_feature_schema(&SchemaConfig {
            include_stddev: false,
            ..SchemaConfig::default()
        });

        assert_eq!(a, b);
        assert_ne!(a.fingerprint, c.fingerprint);
        assert!(Regex::new(r"^[0-9a-f]{64}$").unwrap().is_match(&a.fingerprint));
        assert!(assert_schema_compatible(FEATURE_SCHEMA_VERSION, &a.fingerprint, &b).is_ok());
        assert_eq!(
            assert_schema_compatible(FEATURE_SCHEMA_VERSION, &a.fingerprint, &c),
            Err(SchemaError::FingerprintMismatch {
                expected: a.fingerprint.clone(),
                actual: c.fingerprint.clone(),
            })
        );
    }

    #[test]
    fn namespaces_have_distinct_first_characters() {
        let schema = build_feature_schema(&SchemaConfig::default());
        let mut firsts: Vec<char> = schema
            .groups()
            .iter()
            .filter_map(|group| group.namespace().chars().next())
            .collect();
        firsts.sort_unstable();
        firsts.dedup();
        assert_eq!(firsts.len(), schema.groups().len());
    }

    #[test]
    fn check_columns_separates_identifiers_and_unknowns() {
        let schema = build_feature_schema(&SchemaConfig::default());
        let coverage = schema.check_columns(["msno", "is_churn", "city", "city_1", "bogus"]);

        assert!(coverage.has_label);
        assert_eq!(coverage.mapped, vec!["city".to_string()]);
        assert_eq!(
            coverage.unmapped,
            vec!["city_1".to_string(), "bogus".to_string()]
        );
    }
}
