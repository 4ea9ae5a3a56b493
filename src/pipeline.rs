//! End-to-end run over one dataset: build and persist the feature table,
//! then encode it into learner records when it is in hashing mode.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::builder::{
    build_feature_table, default_output_path, manifest_path, read_feature_table_manifest,
    write_feature_table, BuildError, Dataset, FeatureTableConfig, FeatureTableInputs,
    FeatureTableManifest, FeatureTableReport, OutputMode,
};
use crate::encoder::{
    write_encoded_records, EncodeError, EncodeReport, EncoderConfig, RecordEncoder,
    UnmappedColumnPolicy,
};
use crate::observability::{env_bool, env_value};
use crate::schema::{FeatureSchema, TransactionFeatureSet};
use crate::transactions::ZeroPlanDaysPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub data_root: PathBuf,
    pub table: FeatureTableConfig,
    pub encoder: EncoderConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            table: FeatureTableConfig::default(),
            encoder: EncoderConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("record encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub table_path: PathBuf,
    pub manifest: FeatureTableManifest,
    pub report: FeatureTableReport,
    pub records_path: Option<PathBuf>,
    pub encode_report: Option<EncodeReport>,
    /// A table from an incompatible schema was at `table_path` and got replaced.
    pub replaced_stale_table: bool,
}

/// Invalid values fall back to the defaults. Setting `CHURN_CACHE_DIR`
/// enables the snapshot cache.
pub fn pipeline_config_from_env() -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Some(root) = env_value("CHURN_DATA_ROOT") {
        config.data_root = PathBuf::from(root);
    }

    if let Some(dataset) = env_value("CHURN_DATASET").and_then(|raw| Dataset::parse(&raw)) {
        config.table.dataset = dataset;
    }

    if let Some(mode) = env_value("CHURN_OUTPUT_MODE").and_then(|raw| OutputMode::parse(&raw))
    {
        config.table.output_mode = mode;
    }

    if let Some(dir) = env_value("CHURN_CACHE_DIR") {
        config.table.cache.enabled = true;
        config.table.cache.dir = PathBuf::from(dir);
    }

    if let Some(force) = env_bool("CHURN_FORCE_REBUILD") {
        config.table.cache.force_rebuild = force;
    }

    if let Some(extended) = env_bool("CHURN_EXTENDED_FEATURES") {
        config.table.schema.transaction_features = if extended {
            TransactionFeatureSet::Extended
        } else {
            TransactionFeatureSet::Basic
        };
    }

    if let Some(include) = env_bool("CHURN_INCLUDE_STDDEV") {
        config.table.schema.include_stddev = include;
    }

    if let Some(policy) =
        env_value("CHURN_ZERO_PLAN_DAYS").and_then(|raw| parse_zero_plan_days(&raw))
    {
        config.table.zero_plan_days = policy;
    }

    if let Some(strict) = env_bool("CHURN_STRICT_COLUMNS") {
        config.encoder.unmapped = if strict {
            UnmappedColumnPolicy::Reject
        } else {
            UnmappedColumnPolicy::Warn
        };
    }

    config
}

fn parse_zero_plan_days(raw: &str) -> Option<ZeroPlanDaysPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "exclude" => Some(ZeroPlanDaysPolicy::Exclude),
        "zero" | "treat_as_zero" => Some(ZeroPlanDaysPolicy::TreatAsZero),
        _ => None,
    }
}

/// `features/<dataset>_records.jsonl` under `data_root`.
pub fn records_output_path(data_root: &Path, dataset: Dataset) -> PathBuf {
    data_root
        .join("features")
        .join(format!("{}_records.jsonl", dataset.as_str()))
}

pub fn run_pipeline(cfg: &PipelineConfig) -> Result<PipelineOutcome, PipelineError> {
    let dataset = cfg.table.dataset;
    let inputs = FeatureTableInputs::for_dataset(&cfg.data_root, dataset);
    info!(
        component = "pipeline",
        event = "pipeline.start",
        data_root = %cfg.data_root.display(),
        dataset = dataset.as_str(),
        output_mode = cfg.table.output_mode.as_str()
    );

    let feature_table = build_feature_table(&inputs, &cfg.table)?;
    let table_path = default_output_path(&cfg.data_root, dataset, feature_table.output_mode);
    let replaced_stale_table = existing_table_is_stale(&table_path, &feature_table.schema)?;
    let manifest = write_feature_table(&feature_table, &table_path)?;

    let (records_path, encode_report) = if feature_table.output_mode == OutputMode::Hashing {
        let records_path = records_output_path(&cfg.data_root, dataset);
        let encoder = RecordEncoder::new(&feature_table.schema, cfg.encoder);
        let report = write_encoded_records(&table_path, &records_path, &encoder)?;
        (Some(records_path), Some(report))
    } else {
        info!(
            component = "pipeline",
            event = "pipeline.encode.skipped",
            output_mode = feature_table.output_mode.as_str()
        );
        (None, None)
    };

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        dataset = dataset.as_str(),
        table_path = %table_path.display(),
        rows = manifest.row_count,
        encoded_rows = encode_report.as_ref().map(|r| r.rows).unwrap_or(0)
    );

    Ok(PipelineOutcome {
        table_path,
        manifest,
        report: feature_table.report,
        records_path,
        encode_report,
        replaced_stale_table,
    })
}

/// True when a table already persisted at `table_path` was written under a
/// different schema, or its manifest no longer parses.
fn existing_table_is_stale(table_path: &Path, schema: &FeatureSchema) -> Result<bool, BuildError> {
    if !manifest_path(table_path).is_file() {
        return Ok(false);
    }
    let reason = match read_feature_table_manifest(table_path) {
        Ok(previous) => match previous.check_schema(schema) {
            Ok(()) => return Ok(false),
            Err(err) => err.to_string(),
        },
        Err(err @ BuildError::Manifest { .. }) => err.to_string(),
        Err(err) => return Err(err),
    };
    warn!(
        component = "pipeline",
        event = "pipeline.table.stale",
        table_path = %table_path.display(),
        reason = %reason
    );
    Ok(true)
}
