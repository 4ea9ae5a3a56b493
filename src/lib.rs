//! Churn feature pipeline core.
//!
//! Current implemented scope:
//! - categorical normalization with an explicit null policy
//! - per-user transaction statistics scoped to the base population
//! - feature table assembly (members, transactions, usage logs) with
//!   null filling and optional indicator expansion
//! - namespaced record encoding for hashing-trick learners
//! - opt-in content-addressed snapshot cache and persisted manifests

mod builder;
mod cache;
mod category;
mod encoder;
mod members;
mod observability;
mod pipeline;
mod schema;
mod table;
mod transactions;
mod usage;

pub use builder::{
    build_feature_table, build_feature_table_from_parts, default_output_path, manifest_path,
    read_feature_table_manifest, write_feature_table, AssemblyStats, BuildError, BuildStage,
    Dataset, FeatureTable, FeatureTableConfig, FeatureTableInputs, FeatureTableManifest,
    FeatureTableReport, OutputMode, MEMBERS_FILE, TRANSACTIONS_FILE,
};
pub use cache::{
    file_sha256_hex, load_or_build, snapshot_path, CacheConfig, CacheKey, CacheKeyBuilder,
    CacheOutcome,
};
pub use category::{
    normalize_categories, normalize_table_column, one_hot_encode, CategoricalColumn,
    CategoryValue, NullPolicy, NullSubstitute,
};
pub use encoder::{
    encode_records, write_encoded_records, EncodeError, EncodeReport, EncodedRecord,
    EncoderConfig, FeatureValue, RecordEncoder, UnmappedColumnPolicy, DEFAULT_PROGRESS_EVERY,
};
pub use members::{
    category_domains, clip_column, normalize_members, read_members, AGE_COLUMN, MAX_AGE, MIN_AGE, RAW_AGE_COLUMN,
};
pub use observability::{
    init_logging, log_logging_ready, logging_config_from_env, logging_dispatch, LogFormat,
    LoggingConfig, LoggingInitError, LOG_FILTER_VAR, LOG_FORMAT_VAR, LOG_TARGET_VAR,
};
pub use pipeline::{
    pipeline_config_from_env, records_output_path, run_pipeline, PipelineConfig, PipelineError,
    PipelineOutcome,
};
pub use schema::{
    assert_schema_compatible, build_feature_schema, usage_column_name, ColumnCoverage,
    FeatureGroup, FeatureSchema, FeatureSpec, SchemaConfig, SchemaError, TransactionFeatureSet,
    UsageAggregate, FEATURE_SCHEMA_VERSION, USAGE_METRICS,
};
pub use table::{format_number, Cell, JoinOutcome, Table, TableError};
pub use transactions::{
    aggregate_transactions, derive_transaction, parse_yyyymmdd, read_transactions,
    read_transactions_from, DerivedTransaction, TransactionAggregationConfig,
    TransactionAggregationReport, TransactionError, TransactionRecord, ZeroPlanDaysPolicy,
    TRANSACTION_COLUMNS,
};
pub use usage::{canonical_usage_column, normalize_usage_columns, read_usage_statistics};
