//! Feature table assembly.
//!
//! The base table is the population: every step is a left join that keeps
//! each of its rows, so the output has exactly one row per base row. After
//! the final fill pass no column other than the key and label is missing.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cache::{load_or_build, CacheConfig, CacheKey, CacheKeyBuilder, CacheOutcome};
use crate::category::one_hot_encode;
use crate::members::{
    category_domains, clip_column, normalize_members, read_members, AGE_COLUMN, MAX_AGE, MIN_AGE,
};
use crate::schema::{
    assert_schema_compatible, build_feature_schema, FeatureSchema, SchemaConfig, SchemaError,
};
use crate::table::{write_atomic, Table, TableError};
use crate::transactions::{
    aggregate_transactions, read_transactions, TransactionAggregationConfig,
    TransactionAggregationReport, TransactionError, TransactionRecord, ZeroPlanDaysPolicy,
};
use crate::usage::{normalize_usage_columns, read_usage_statistics};

pub const MEMBERS_FILE: &str = "members_v3.csv";
pub const TRANSACTIONS_FILE: &str = "transactions.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Categorical columns expanded into `<column>_<category>` indicators.
    OneHot,
    /// Categorical columns kept as-is for hashing-trick learners.
    Hashing,
}

impl OutputMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneHot => "one_hot",
            Self::Hashing => "hashing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "one_hot" | "onehot" | "one-hot" => Some(Self::OneHot),
            "hashing" | "vw" => Some(Self::Hashing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Train,
    Validation,
}

impl Dataset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "train" => Some(Self::Train),
            "validation" | "valid" => Some(Self::Validation),
            _ => None,
        }
    }

    pub fn base_file(self) -> &'static str {
        match self {
            Self::Train => "train_v2.csv",
            Self::Validation => "sample_submission_v2.csv",
        }
    }

    pub fn usage_file(self) -> &'static str {
        match self {
            Self::Train => "train_ulog_features.csv",
            Self::Validation => "validation_ulog_features.csv",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTableInputs {
    pub base: PathBuf,
    pub members: PathBuf,
    pub transactions: PathBuf,
    pub usage: PathBuf,
}

impl FeatureTableInputs {
    /// Conventional file names for `dataset` under `data_root`.
    pub fn for_dataset(data_root: &Path, dataset: Dataset) -> Self {
        Self {
            base: data_root.join(dataset.base_file()),
            members: data_root.join(MEMBERS_FILE),
            transactions: data_root.join(TRANSACTIONS_FILE),
            usage: data_root.join(dataset.usage_file()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTableConfig {
    pub dataset: Dataset,
    pub output_mode: OutputMode,
    pub schema: SchemaConfig,
    pub zero_plan_days: ZeroPlanDaysPolicy,
    pub cache: CacheConfig,
}

impl Default for FeatureTableConfig {
    fn default() -> Self {
        Self {
            dataset: Dataset::Train,
            output_mode: OutputMode::OneHot,
            schema: SchemaConfig::default(),
            zero_plan_days: ZeroPlanDaysPolicy::Exclude,
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStage {
    Base,
    Members,
    OneHot,
    Statistics,
    Usage,
    Fill,
    Cache,
    Persist,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Base => "base",
            Self::Members => "members",
            Self::OneHot => "one_hot",
            Self::Statistics => "transaction_statistics",
            Self::Usage => "usage",
            Self::Fill => "fill",
            Self::Cache => "cache",
            Self::Persist => "persist",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{stage} stage failed: {source}")]
    Table {
        stage: BuildStage,
        #[source]
        source: TableError,
    },
    #[error("transaction_statistics stage failed: {0}")]
    Transactions(#[from] TransactionError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{stage} stage failed for {path}: {source}")]
    Io {
        stage: BuildStage,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Snapshot reads and writes inside the cache layer.
impl From<TableError> for BuildError {
    fn from(source: TableError) -> Self {
        Self::Table {
            stage: BuildStage::Cache,
            source,
        }
    }
}

fn at(stage: BuildStage) -> impl FnOnce(TableError) -> BuildError {
    move |source| BuildError::Table { stage, source }
}

/// Per-step counters; absent when the whole table came from the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssemblyStats {
    pub label_dropped: bool,
    pub member_matches: usize,
    pub indicator_columns: usize,
    pub statistics_matches: usize,
    pub usage_matches: usize,
    pub filled_cells: usize,
    pub transactions: Option<TransactionAggregationReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureTableReport {
    pub dataset: Dataset,
    pub output_mode: OutputMode,
    pub rows: usize,
    pub columns: usize,
    pub cache: CacheOutcome,
    pub assembly: Option<AssemblyStats>,
}

#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub dataset: Dataset,
    pub output_mode: OutputMode,
    pub table: Table,
    pub report: FeatureTableReport,
}

/// Builds the feature table from files, reusing cached snapshots of the
/// members, transaction statistics and finished table when enabled.
pub fn build_feature_table(
    inputs: &FeatureTableInputs,
    cfg: &FeatureTableConfig,
) -> Result<FeatureTable, BuildError> {
    let schema = build_feature_schema(&cfg.schema);
    let text_columns = [schema.key_column.as_str()];
    info!(
        component = "feature_table",
        event = "feature_table.build.start",
        dataset = cfg.dataset.as_str(),
        output_mode = cfg.output_mode.as_str(),
        cache_enabled = cfg.cache.enabled,
        force_rebuild = cfg.cache.force_rebuild,
        base = %inputs.base.display()
    );

    let mut assembly = None;
    let (table, cache) = load_or_build::<BuildError, _, _>(
        &cfg.cache,
        "feature_table",
        || {
            stage_key("feature_table", &schema, cfg)
                .field("output_mode", cfg.output_mode.as_str())
                .field("dataset", cfg.dataset.as_str())
                .file("base", &inputs.base)
                .and_then(|key| key.file("members", &inputs.members))
                .and_then(|key| key.file("transactions", &inputs.transactions))
                .and_then(|key| key.file("usage", &inputs.usage))
                .map(CacheKeyBuilder::finish)
                .map_err(at(BuildStage::Cache))
        },
        &text_columns,
        || {
            let base = Table::read_csv(&inputs.base, "base", &text_columns)
                .map_err(at(BuildStage::Base))?;
            let (members, _) = load_or_build::<BuildError, _, _>(
                &cfg.cache,
                "members",
                || members_key(&schema, cfg, &inputs.members),
                &text_columns,
                || read_members(&inputs.members, &schema).map_err(at(BuildStage::Members)),
            )?;
            let usage =
                read_usage_statistics(&inputs.usage, &schema).map_err(at(BuildStage::Usage))?;

            let (table, stats) =
                assemble(base, &members, &usage, &schema, cfg, |population| {
                    let mut report = None;
                    let (statistics, _) = load_or_build::<BuildError, _, _>(
                        &cfg.cache,
                        "transaction_statistics",
                        || statistics_key(&schema, cfg, &inputs.base, &inputs.transactions),
                        &text_columns,
                        || {
                            let records = read_transactions(&inputs.transactions)?;
                            let (statistics, aggregated) = aggregate_transactions(
                                population,
                                &schema.key_column,
                                records,
                                &aggregation_config(&schema, cfg),
                            )?;
                            report = Some(aggregated);
                            Ok(statistics)
                        },
                    )?;
                    Ok((statistics, report))
                })?;
            assembly = Some(stats);
            Ok(table)
        },
    )?;

    Ok(finish(schema, cfg, table, cache, assembly))
}

/// In-memory variant of [`build_feature_table`]: raw member and usage tables
/// are normalized here, and no cache is consulted.
pub fn build_feature_table_from_parts<I>(
    base: Table,
    members: Table,
    transactions: I,
    usage: Table,
    cfg: &FeatureTableConfig,
) -> Result<FeatureTable, BuildError>
where
    I: IntoIterator<Item = TransactionRecord>,
{
    let schema = build_feature_schema(&cfg.schema);
    let members = normalize_members(members, &schema).map_err(at(BuildStage::Members))?;
    let usage = normalize_usage_columns(usage, &schema).map_err(at(BuildStage::Usage))?;

    let (table, stats) = assemble(base, &members, &usage, &schema, cfg, |population| {
        let (statistics, report) = aggregate_transactions(
            population,
            &schema.key_column,
            transactions,
            &aggregation_config(&schema, cfg),
        )?;
        Ok((statistics, Some(report)))
    })?;

    Ok(finish(schema, cfg, table, CacheOutcome::Disabled, Some(stats)))
}

fn finish(
    schema: FeatureSchema,
    cfg: &FeatureTableConfig,
    table: Table,
    cache: CacheOutcome,
    assembly: Option<AssemblyStats>,
) -> FeatureTable {
    let report = FeatureTableReport {
        dataset: cfg.dataset,
        output_mode: cfg.output_mode,
        rows: table.row_count(),
        columns: table.columns().len(),
        cache,
        assembly,
    };
    info!(
        component = "feature_table",
        event = "feature_table.build.finish",
        dataset = cfg.dataset.as_str(),
        output_mode = cfg.output_mode.as_str(),
        rows = report.rows,
        columns = report.columns,
        cache = ?cache
    );
    FeatureTable {
        schema,
        dataset: cfg.dataset,
        output_mode: cfg.output_mode,
        table,
        report,
    }
}

fn aggregation_config(
    schema: &FeatureSchema,
    cfg: &FeatureTableConfig,
) -> TransactionAggregationConfig {
    TransactionAggregationConfig {
        feature_set: schema.transaction_features,
        zero_plan_days: cfg.zero_plan_days,
    }
}

fn stage_key(stage: &str, schema: &FeatureSchema, cfg: &FeatureTableConfig) -> CacheKeyBuilder {
    CacheKeyBuilder::new(stage)
        .field("schema", &schema.fingerprint)
        .field("zero_plan_days", &format!("{:?}", cfg.zero_plan_days))
}

fn members_key(
    schema: &FeatureSchema,
    cfg: &FeatureTableConfig,
    members: &Path,
) -> Result<CacheKey, BuildError> {
    stage_key("members", schema, cfg)
        .file("members", members)
        .map(CacheKeyBuilder::finish)
        .map_err(at(BuildStage::Members))
}

/// The population comes from the base file, so it is part of the key.
fn statistics_key(
    schema: &FeatureSchema,
    cfg: &FeatureTableConfig,
    base: &Path,
    transactions: &Path,
) -> Result<CacheKey, BuildError> {
    stage_key("transaction_statistics", schema, cfg)
        .file("base", base)
        .and_then(|key| key.file("transactions", transactions))
        .map(CacheKeyBuilder::finish)
        .map_err(at(BuildStage::Statistics))
}

/// Steps 1-7 over already-normalized member and usage tables. `statistics`
/// receives the current population and returns its transaction statistics.
fn assemble<F>(
    mut base: Table,
    members: &Table,
    usage: &Table,
    schema: &FeatureSchema,
    cfg: &FeatureTableConfig,
    statistics: F,
) -> Result<(Table, AssemblyStats), BuildError>
where
    F: FnOnce(&Table) -> Result<(Table, Option<TransactionAggregationReport>), BuildError>,
{
    let key = schema.key_column.as_str();
    let mut stats = AssemblyStats::default();

    base.require_column(key).map_err(at(BuildStage::Base))?;
    let domains = if cfg.output_mode == OutputMode::OneHot {
        category_domains(members, schema).map_err(at(BuildStage::OneHot))?
    } else {
        Vec::new()
    };
    if cfg.dataset == Dataset::Validation {
        stats.label_dropped = base.drop_column(&schema.label_column);
    }

    let joined = base.left_join(members, key).map_err(at(BuildStage::Members))?;
    stats.member_matches = joined.matched_rows;
    let mut table = joined.table;
    for (column, substitute) in schema.null_policy.entries() {
        table
            .fill_missing(column, &substitute.to_cell())
            .map_err(at(BuildStage::Members))?;
    }
    clip_column(&mut table, AGE_COLUMN, MIN_AGE, MAX_AGE).map_err(at(BuildStage::Members))?;
    info!(
        component = "feature_table",
        event = "feature_table.members.joined",
        rows = table.row_count(),
        matched = stats.member_matches
    );

    if cfg.output_mode == OutputMode::OneHot {
        for (column, domain) in &domains {
            let indicators =
                one_hot_encode(&mut table, column, domain).map_err(at(BuildStage::OneHot))?;
            stats.indicator_columns += indicators.len();
        }
    }

    let (statistics_table, report) = statistics(&table)?;
    stats.transactions = report;
    let joined = table
        .left_join(&statistics_table, key)
        .map_err(at(BuildStage::Statistics))?;
    stats.statistics_matches = joined.matched_rows;
    table = joined.table;
    info!(
        component = "feature_table",
        event = "feature_table.statistics.joined",
        matched = stats.statistics_matches
    );

    let joined = table.left_join(usage, key).map_err(at(BuildStage::Usage))?;
    stats.usage_matches = joined.matched_rows;
    table = joined.table;
    info!(
        component = "feature_table",
        event = "feature_table.usage.joined",
        matched = stats.usage_matches
    );

    for column in &schema.dropped_columns {
        table.drop_column(column);
    }

    for column in table.columns_with_missing() {
        if schema.is_identifier(&column) {
            continue;
        }
        let fill = schema.null_policy.fill_cell(&column);
        stats.filled_cells += table
            .fill_missing(&column, &fill)
            .map_err(at(BuildStage::Fill))?;
    }
    info!(
        component = "feature_table",
        event = "feature_table.fill",
        filled_cells = stats.filled_cells,
        columns = table.columns().len()
    );

    Ok((table, stats))
}

/// Sidecar describing a persisted feature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTableManifest {
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub dataset: Dataset,
    pub output_mode: OutputMode,
    pub row_count: usize,
    pub columns: Vec<String>,
}

impl FeatureTableManifest {
    pub fn check_schema(&self, schema: &FeatureSchema) -> Result<(), SchemaError> {
        assert_schema_compatible(self.schema_version, &self.schema_fingerprint, schema)
    }
}

/// `features/<dataset>_<mode>.csv` under `data_root`.
pub fn default_output_path(data_root: &Path, dataset: Dataset, mode: OutputMode) -> PathBuf {
    data_root
        .join("features")
        .join(format!("{}_{}.csv", dataset.as_str(), mode.as_str()))
}

pub fn manifest_path(table_path: &Path) -> PathBuf {
    let mut name = table_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".manifest.json");
    table_path.with_file_name(name)
}

/// Writes the table CSV and then its manifest, both atomically.
pub fn write_feature_table(
    feature_table: &FeatureTable,
    path: &Path,
) -> Result<FeatureTableManifest, BuildError> {
    feature_table
        .table
        .write_csv(path)
        .map_err(at(BuildStage::Persist))?;

    let manifest = FeatureTableManifest {
        schema_version: feature_table.schema.version,
        schema_fingerprint: feature_table.schema.fingerprint.clone(),
        dataset: feature_table.dataset,
        output_mode: feature_table.output_mode,
        row_count: feature_table.table.row_count(),
        columns: feature_table.table.columns().to_vec(),
    };
    let sidecar = manifest_path(path);
    let bytes = serde_json::to_vec_pretty(&manifest).map_err(|source| BuildError::Manifest {
        path: sidecar.clone(),
        source,
    })?;
    write_atomic(&sidecar, &bytes).map_err(|source| BuildError::Io {
        stage: BuildStage::Persist,
        path: sidecar.clone(),
        source,
    })?;

    info!(
        component = "feature_table",
        event = "feature_table.persisted",
        path = %path.display(),
        manifest = %sidecar.display(),
        rows = manifest.row_count
    );
    Ok(manifest)
}

pub fn read_feature_table_manifest(table_path: &Path) -> Result<FeatureTableManifest, BuildError> {
    let path = manifest_path(table_path);
    let bytes = fs::read(&path).map_err(|source| BuildError::Io {
        stage: BuildStage::Persist,
        path: path.clone(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| BuildError::Manifest { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;

    fn table(name: &str, body: &str) -> Table {
        Table::from_reader(body.as_bytes(), name, &["msno"]).unwrap()
    }

    fn usage_body(users: &[&str]) -> String {
        let schema = build_feature_schema(&SchemaConfig::default());
        let columns = schema.usage_columns();
        let mut body = format!("msno,{}\n", columns.join(","));
        for user in users {
            let values = vec!["1"; columns.len()].join(",");
            body.push_str(&format!("{user},{values}\n"));
        }
        body
    }

    fn record(msno: &str, paid: f64, cancel: i64) -> TransactionRecord {
        TransactionRecord {
            msno: msno.to_string(),
            plan_list_price: paid,
            actual_amount_paid: paid,
            is_cancel: cancel,
            payment_plan_days: 30,
            transaction_date: 20170101,
            membership_expire_date: 20170131,
        }
    }

    #[test]
    fn validation_drops_label_and_hashing_keeps_categories() {
        let cfg = FeatureTableConfig {
            dataset: Dataset::Validation,
            output_mode: OutputMode::Hashing,
            ..FeatureTableConfig::default()
        };
        let ft = build_feature_table_from_parts(
            table("base", "msno,is_churn\nu1,0\nu2,0\n"),
            table(
                "members",
                "msno,city,bd,gender,registered_via,registration_init_time\nu1,5,30,,7,20150101\n",
            ),
            vec![record("u1", 99.0, 0)],
            table("usage", &usage_body(&["u2"])),
            &cfg,
        )
        .unwrap();

        let t = &ft.table;
        assert!(!t.has_column("is_churn"));
        assert!(!t.has_column("registration_init_time"));
        assert_eq!(t.cell(0, "gender"), Some(&Cell::Text("not_specified".to_string())));
        assert_eq!(t.cell(1, "city"), Some(&Cell::Number(0.0)));
        assert_eq!(t.cell(1, "num_transactions"), Some(&Cell::Number(0.0)));
        assert_eq!(t.cell(0, "avg_num_25"), Some(&Cell::Number(0.0)));
        assert_eq!(t.cell(1, "avg_num_25"), Some(&Cell::Number(1.0)));

        let stats = ft.report.assembly.unwrap();
        assert!(stats.label_dropped);
        assert_eq!(stats.member_matches, 1);
        assert_eq!(stats.statistics_matches, 1);
        assert_eq!(stats.usage_matches, 1);
        assert_eq!(stats.indicator_columns, 0);
    }

    #[test]
    fn missing_key_column_names_the_base_stage() {
        let err = build_feature_table_from_parts(
            table("base", "user,is_churn\nu1,0\n"),
            table("members", "msno,city,bd,gender,registered_via\nu1,5,30,male,7\n"),
            Vec::new(),
            table("usage", &usage_body(&[])),
            &FeatureTableConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Table {
                stage: BuildStage::Base,
                source: TableError::MissingColumn { .. }
            }
        ));
    }

    #[test]
    fn manifest_path_appends_suffix() {
        assert_eq!(
            manifest_path(Path::new("/data/features/train_hashing.csv")),
            PathBuf::from("/data/features/train_hashing.csv.manifest.json")
        );
        assert_eq!(
            default_output_path(Path::new("/data"), Dataset::Validation, OutputMode::OneHot),
            PathBuf::from("/data/features/validation_one_hot.csv")
        );
    }

    #[test]
    fn parses_modes_and_datasets() {
        assert_eq!(OutputMode::parse(" One_Hot "), Some(OutputMode::OneHot));
        assert_eq!(OutputMode::parse("vw"), Some(OutputMode::Hashing));
        assert_eq!(OutputMode::parse("dense"), None);
        assert_eq!(Dataset::parse("VALID"), Some(Dataset::Validation));
        assert_eq!(Dataset::Train.base_file(), "train_v2.csv");
    }
}
