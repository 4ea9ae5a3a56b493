use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use churnfeat::{
    build_feature_schema, build_feature_table_from_parts, encode_records, log_logging_ready,
    logging_dispatch, EncoderConfig, FeatureTableConfig, LogFormat, LoggingConfig, OutputMode,
    RecordEncoder, SchemaConfig, Table, TransactionRecord, USAGE_METRICS,
};
use tracing::dispatcher::with_default;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_with(config: &LoggingConfig, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let dispatch = logging_dispatch(config, writer.clone()).expect("subscriber should build");
    with_default(&dispatch, f);
    writer.output_string()
}

fn capture_logs(filter: &str, f: impl FnOnce()) -> String {
    let config = LoggingConfig {
        filter: filter.to_string(),
        format: LogFormat::Json,
        include_target: false,
    };
    capture_with(&config, f)
}

fn table(name: &str, body: &str) -> Table {
    Table::from_reader(body.as_bytes(), name, &["msno"]).expect("fixture table should parse")
}

fn usage_table() -> Table {
    let mut header = vec!["msno".to_string()];
    for aggregate in ["avg", "min", "max", "sum", "stddev"] {
        for metric in USAGE_METRICS {
            header.push(format!("{aggregate}({metric})"));
        }
    }
    header.push("is_churn".to_string());
    table("usage", &format!("{}\n", header.join(",")))
}

fn zero_day_record(msno: &str) -> TransactionRecord {
    TransactionRecord {
        msno: msno.to_string(),
        plan_list_price: 0.0,
        actual_amount_paid: 0.0,
        is_cancel: 0,
        payment_plan_days: 0,
        transaction_date: 20170101,
        membership_expire_date: 20170101,
    }
}

#[test]
fn feature_table_build_emits_stage_events() {
    let logs = capture_logs("info", || {
        let ft = build_feature_table_from_parts(
            table("base", "msno,is_churn\nA,1\n"),
            table("members", "msno,city,bd,gender,registered_via\nA,1,20,male,7\n"),
            vec![zero_day_record("A")],
            usage_table(),
            &FeatureTableConfig {
                output_mode: OutputMode::Hashing,
                ..FeatureTableConfig::default()
            },
        )
        .expect("feature table should build");
        assert_eq!(ft.table.row_count(), 1);
    });

    assert!(logs.contains("\"event\":\"schema.built\""));
    assert!(logs.contains("\"event\":\"members.normalized\""));
    assert!(logs.contains("\"event\":\"usage.column.dropped\""));
    assert!(logs.contains("\"event\":\"transactions.zero_plan_days\""));
    assert!(logs.contains("\"event\":\"transactions.aggregate.finish\""));
    assert!(logs.contains("\"event\":\"feature_table.fill\""));
    assert!(logs.contains("\"event\":\"feature_table.build.finish\""));
}

#[test]
fn encoder_warns_once_per_unmapped_column_and_reports_progress() {
    let schema = build_feature_schema(&SchemaConfig::default());
    let encoder = RecordEncoder::new(
        &schema,
        EncoderConfig {
            progress_every: 1,
            ..EncoderConfig::default()
        },
    );
    let input = "msno,age,bogus\nu1,20,1\nu2,30,2\n";

    let logs = capture_logs("info", || {
        let report =
            encode_records(input.as_bytes(), io::sink(), &encoder).expect("stream should encode");
        assert_eq!(report.rows, 2);
    });

    assert_eq!(
        logs.matches("\"event\":\"records.encode.unmapped_column\"")
            .count(),
        1
    );
    assert_eq!(
        logs.matches("\"event\":\"records.encode.progress\"").count(),
        2
    );
    assert!(logs.contains("\"event\":\"records.encode.finish\""));
}

#[test]
fn dropped_columns_are_traced_per_row_at_debug() {
    let schema = build_feature_schema(&SchemaConfig::default());
    let encoder = RecordEncoder::new(&schema, EncoderConfig::default());

    let logs = capture_logs("debug", || {
        encode_records("msno,bogus\nu1,1\n".as_bytes(), io::sink(), &encoder)
            .expect("stream should encode");
    });

    assert!(logs.contains("\"event\":\"records.encode.dropped_column\""));
}

#[test]
fn logging_ready_helper_emits_baseline_event() {
    let logs = capture_logs("info", || {
        log_logging_ready(&LoggingConfig::default());
    });

    assert!(logs.contains("\"event\":\"logging.ready\""));
    assert!(logs.contains("\"log_format\":\"compact\""));
}

#[test]
fn filter_directives_scope_the_crate_events() {
    let logs = capture_logs("churnfeat=warn,info", || {
        log_logging_ready(&LoggingConfig::default());
        tracing::warn!(component = "test", event = "outside.crate");
    });
    assert!(!logs.contains("\"event\":\"logging.ready\""));
    assert!(logs.contains("\"event\":\"outside.crate\""));
}

#[test]
fn compact_format_writes_one_line_per_event() {
    let config = LoggingConfig::default();
    let logs = capture_with(&config, || log_logging_ready(&config));
    assert_eq!(logs.lines().count(), 1);
    assert!(logs.contains("logging.ready"));
    assert!(!logs.trim_start().starts_with('{'));
}
