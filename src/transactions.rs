//! Per-user transaction statistics.
//!
//! Transactions are scoped to the base population before grouping, so rows
//! for users outside the population never influence an aggregate. Each
//! user's records are sorted by a total key before reduction, which makes
//! every floating-point sum independent of input row order.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::schema::TransactionFeatureSet;
use crate::table::{Cell, Table, TableError};

pub const TRANSACTION_COLUMNS: [&str; 7] = [
    "msno",
    "plan_list_price",
    "actual_amount_paid",
    "is_cancel",
    "payment_plan_days",
    "transaction_date",
    "membership_expire_date",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub msno: String,
    pub plan_list_price: f64,
    pub actual_amount_paid: f64,
    pub is_cancel: i64,
    pub payment_plan_days: i64,
    pub transaction_date: u32,
    pub membership_expire_date: u32,
}

/// What to do with `amount_paid / payment_plan_days` when the plan length is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZeroPlanDaysPolicy {
    /// The record contributes nothing to the amount-per-day statistics.
    Exclude,
    /// The record's amount per day is 0.
    TreatAsZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedTransaction {
    pub discount: f64,
    pub is_discount: bool,
    pub amount_per_day: Option<f64>,
    pub membership_duration_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAggregationConfig {
    pub feature_set: TransactionFeatureSet,
    pub zero_plan_days: ZeroPlanDaysPolicy,
}

impl Default for TransactionAggregationConfig {
    fn default() -> Self {
        Self {
            feature_set: TransactionFeatureSet::Extended,
            zero_plan_days: ZeroPlanDaysPolicy::Exclude,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAggregationReport {
    pub records_read: u64,
    pub records_in_population: u64,
    pub records_outside_population: u64,
    pub zero_plan_day_records: u64,
    pub users_with_statistics: u64,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid {field} '{value}' for user {msno}")]
    InvalidDate {
        msno: String,
        field: &'static str,
        value: u32,
    },
}

pub fn read_transactions(path: &Path) -> Result<Vec<TransactionRecord>, TransactionError> {
    if !path.is_file() {
        return Err(TableError::MissingInput {
            table: "transactions".to_string(),
            path: path.to_path_buf(),
        }
        .into());
    }
    let records = read_transactions_from(fs::File::open(path)?)?;
    info!(
        component = "transactions",
        event = "transactions.read",
        path = %path.display(),
        records = records.len()
    );
    Ok(records)
}

pub fn read_transactions_from<R: Read>(
    reader: R,
) -> Result<Vec<TransactionRecord>, TransactionError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    for column in TRANSACTION_COLUMNS {
        if !headers.iter().any(|header| header == column) {
            return Err(TableError::MissingColumn {
                table: "transactions".to_string(),
                column: column.to_string(),
            }
            .into());
        }
    }

    let mut records = Vec::new();
    for record in reader.deserialize() {
        records.push(record?);
    }
    Ok(records)
}

pub fn parse_yyyymmdd(raw: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt((raw / 10_000) as i32, (raw / 100) % 100, raw % 100)
}

pub fn derive_transaction(
    record: &TransactionRecord,
    policy: ZeroPlanDaysPolicy,
) -> Result<DerivedTransaction, TransactionError> {
    let transaction_date =
        parse_yyyymmdd(record.transaction_date).ok_or_else(|| TransactionError::InvalidDate {
            msno: record.msno.clone(),
            field: "transaction_date",
            value: record.transaction_date,
        })?;
    let expire_date = parse_yyyymmdd(record.membership_expire_date).ok_or_else(|| {
        TransactionError::InvalidDate {
            msno: record.msno.clone(),
            field: "membership_expire_date",
            value: record.membership_expire_date,
        }
    })?;

    let discount = record.plan_list_price - record.actual_amount_paid;
    let amount_per_day = match (record.payment_plan_days, policy) {
        (0, ZeroPlanDaysPolicy::Exclude) => None,
        (0, ZeroPlanDaysPolicy::TreatAsZero) => Some(0.0),
        (days, _) => Some(record.actual_amount_paid / days as f64),
    };

    Ok(DerivedTransaction {
        discount,
        is_discount: discount > 0.0,
        amount_per_day,
        membership_duration_days: (expire_date - transaction_date).num_days(),
    })
}

#[derive(Debug, Clone)]
struct Observation {
    record: TransactionRecord,
    derived: DerivedTransaction,
}

impl Observation {
    fn order(&self, other: &Self) -> Ordering {
        let a = &self.record;
        let b = &other.record;
        a.transaction_date
            .cmp(&b.transaction_date)
            .then(a.membership_expire_date.cmp(&b.membership_expire_date))
            .then(a.payment_plan_days.cmp(&b.payment_plan_days))
            .then(a.plan_list_price.total_cmp(&b.plan_list_price))
            .then(a.actual_amount_paid.total_cmp(&b.actual_amount_paid))
            .then(a.is_cancel.cmp(&b.is_cancel))
    }
}

/// Reduces transactions to one statistics row per user of `base` that has at
/// least one transaction, in base-table order. Users without transactions
/// get no row.
pub fn aggregate_transactions<I>(
    base: &Table,
    key_column: &str,
    records: I,
    cfg: &TransactionAggregationConfig,
) -> Result<(Table, TransactionAggregationReport), TransactionError>
where
    I: IntoIterator<Item = TransactionRecord>,
{
    let population = base.distinct_keys(key_column)?;
    let index: HashMap<&str, usize> = population
        .iter()
        .enumerate()
        .map(|(idx, key)| (key.as_str(), idx))
        .collect();

    let mut report = TransactionAggregationReport::default();
    let mut groups: Vec<Vec<Observation>> = vec![Vec::new(); population.len()];

    for record in records {
        report.records_read += 1;
        let Some(&slot) = index.get(record.msno.as_str()) else {
            report.records_outside_population += 1;
            continue;
        };
        report.records_in_population += 1;
        if record.payment_plan_days == 0 {
            report.zero_plan_day_records += 1;
        }
        let derived = derive_transaction(&record, cfg.zero_plan_days)?;
        groups[slot].push(Observation { record, derived });
    }
    drop(index);

    let feature_columns = cfg.feature_set.columns();
    let mut columns = vec![key_column.to_string()];
    columns.extend(feature_columns.iter().map(|c| c.to_string()));
    let mut stats = Table::new("transaction_statistics", columns);

    for (key, mut observations) in population.into_iter().zip(groups) {
        if observations.is_empty() {
            continue;
        }
        observations.sort_by(Observation::order);
        let values = reduce(&observations);

        let mut row = Vec::with_capacity(feature_columns.len() + 1);
        row.push(Cell::Text(key));
        row.extend(
            feature_columns
                .iter()
                .map(|column| values.get(column).cloned().unwrap_or(Cell::Missing)),
        );
        stats.push_row(row)?;
        report.users_with_statistics += 1;
    }

    if report.zero_plan_day_records > 0 {
        warn!(
            component = "transactions",
            event = "transactions.zero_plan_days",
            records = report.zero_plan_day_records,
            policy = ?cfg.zero_plan_days
        );
    }

    info!(
        component = "transactions",
        event = "transactions.aggregate.finish",
        records_read = report.records_read,
        records_in_population = report.records_in_population,
        records_outside_population = report.records_outside_population,
        users_with_statistics = report.users_with_statistics,
        feature_set = ?cfg.feature_set
    );

    Ok((stats, report))
}

fn reduce(observations: &[Observation]) -> HashMap<&'static str, Cell> {
    let count = observations.len() as f64;
    let sum = |f: fn(&Observation) -> f64| observations.iter().map(f).sum::<f64>();
    let count_if = |f: fn(&Observation) -> bool| observations.iter().filter(|o| f(o)).count() as f64;

    let total_payments = sum(|o| o.record.actual_amount_paid);
    let total_duration = sum(|o| o.derived.membership_duration_days as f64);
    let per_day: Vec<f64> = observations
        .iter()
        .filter_map(|o| o.derived.amount_per_day)
        .collect();

    let mut values = HashMap::new();
    values.insert("num_transactions", Cell::Number(count));
    values.insert(
        "plan_net_worth",
        Cell::Number(sum(|o| o.record.plan_list_price)),
    );
    values.insert("mean_payment", Cell::Number(total_payments / count));
    values.insert("total_payments", Cell::Number(total_payments));
    values.insert(
        "times_canceled",
        Cell::Number(count_if(|o| o.record.is_cancel == 1)),
    );
    values.insert(
        "num_discounts",
        Cell::Number(count_if(|o| o.derived.is_discount)),
    );
    values.insert("total_discount", Cell::Number(sum(|o| o.derived.discount)));
    values.insert(
        "mean_membership_duration",
        Cell::Number(total_duration / count),
    );
    values.insert("total_membership_duration", Cell::Number(total_duration));

    if per_day.is_empty() {
        values.insert("mean_amt_per_day", Cell::Missing);
        values.insert("total_amt_per_day", Cell::Missing);
    } else {
        let total: f64 = per_day.iter().sum();
        values.insert("mean_amt_per_day", Cell::Number(total / per_day.len() as f64));
        values.insert("total_amt_per_day", Cell::Number(total));
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(msno: &str, list: f64, paid: f64, cancel: i64, days: i64) -> TransactionRecord {
        TransactionRecord {
            msno: msno.to_string(),
            plan_list_price: list,
            actual_amount_paid: paid,
            is_cancel: cancel,
            payment_plan_days: days,
            transaction_date: 20170101,
            membership_expire_date: 20170131,
        }
    }

    fn base(keys: &[&str]) -> Table {
        let mut body = String::from("msno\n");
        for key in keys {
            body.push_str(key);
            body.push('\n');
        }
        Table::from_reader(body.as_bytes(), "base", &["msno"]).unwrap()
    }

    #[test]
    fn yyyymmdd_dates_parse_and_reject_garbage() {
        assert_eq!(
            parse_yyyymmdd(20170228),
            NaiveDate::from_ymd_opt(2017, 2, 28)
        );
        assert_eq!(parse_yyyymmdd(20170230), None);
        assert_eq!(parse_yyyymmdd(0), None);
    }

    #[test]
    fn derived_fields_follow_definitions() {
        let mut r = record("a", 149.0, 99.0, 0, 30);
        r.transaction_date = 20170301;
        r.membership_expire_date = 20170331;
        let d = derive_transaction(&r, ZeroPlanDaysPolicy::Exclude).unwrap();

        assert_eq!(d.discount, 50.0);
        assert!(d.is_discount);
        assert_eq!(d.amount_per_day, Some(3.3));
        assert_eq!(d.membership_duration_days, 30);
    }

    #[test]
    fn zero_plan_days_follow_policy() {
        let r = record("a", 0.0, 0.0, 0, 0);
        let excluded = derive_transaction(&r, ZeroPlanDaysPolicy::Exclude).unwrap();
        let zeroed = derive_transaction(&r, ZeroPlanDaysPolicy::TreatAsZero).unwrap();
        assert_eq!(excluded.amount_per_day, None);
        assert_eq!(zeroed.amount_per_day, Some(0.0));
        assert!(!zeroed.is_discount);
    }

    #[test]
    fn invalid_dates_are_errors() {
        let mut r = record("a", 1.0, 1.0, 0, 30);
        r.membership_expire_date = 20171399;
        let err = derive_transaction(&r, ZeroPlanDaysPolicy::Exclude).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::InvalidDate {
                field: "membership_expire_date",
                ..
            }
        ));
    }

    #[test]
    fn aggregates_per_user_within_population() {
        let records = vec![
            record("A", 10.0, 10.0, 0, 30),
            record("A", 20.0, 20.0, 1, 30),
            record("A", 30.0, 30.0, 0, 30),
            record("Z", 999.0, 999.0, 1, 30),
        ];
        let (stats, report) = aggregate_transactions(
            &base(&["A", "B", "C"]),
            "msno",
            records,
            &TransactionAggregationConfig::default(),
        )
        .unwrap();

        assert_eq!(stats.row_count(), 1);
        assert_eq!(stats.cell(0, "msno"), Some(&Cell::Text("A".to_string())));
        assert_eq!(stats.cell(0, "num_transactions"), Some(&Cell::Number(3.0)));
        assert_eq!(stats.cell(0, "total_payments"), Some(&Cell::Number(60.0)));
        assert_eq!(stats.cell(0, "mean_payment"), Some(&Cell::Number(20.0)));
        assert_eq!(stats.cell(0, "times_canceled"), Some(&Cell::Number(1.0)));
        assert_eq!(stats.cell(0, "plan_net_worth"), Some(&Cell::Number(60.0)));
        assert_eq!(stats.cell(0, "num_discounts"), Some(&Cell::Number(0.0)));
        assert_eq!(report.records_read, 4);
        assert_eq!(report.records_outside_population, 1);
        assert_eq!(report.users_with_statistics, 1);
    }

    #[test]
    fn users_with_only_zero_plan_days_have_missing_per_day_stats() {
        let records = vec![record("A", 10.0, 10.0, 0, 0), record("A", 10.0, 5.0, 0, 0)];
        let (stats, report) = aggregate_transactions(
            &base(&["A"]),
            "msno",
            records,
            &TransactionAggregationConfig::default(),
        )
        .unwrap();

        assert_eq!(report.zero_plan_day_records, 2);
        assert_eq!(stats.cell(0, "mean_amt_per_day"), Some(&Cell::Missing));
        assert_eq!(stats.cell(0, "total_amt_per_day"), Some(&Cell::Missing));
        assert_eq!(stats.cell(0, "total_discount"), Some(&Cell::Number(5.0)));
        assert_eq!(stats.cell(0, "num_discounts"), Some(&Cell::Number(1.0)));
    }

    #[test]
    fn basic_feature_set_emits_basic_columns_only() {
        let cfg = TransactionAggregationConfig {
            feature_set: TransactionFeatureSet::Basic,
            ..TransactionAggregationConfig::default()
        };
        let (stats, _) =
            aggregate_transactions(&base(&["A"]), "msno", vec![record("A", 1.0, 1.0, 0, 1)], &cfg)
                .unwrap();
        assert_eq!(stats.columns().len(), 1 + 5);
        assert!(!stats.has_column("total_discount"));
    }

    #[test]
    fn reduction_is_independent_of_row_order() {
        let mut records: Vec<TransactionRecord> = (0..20)
            .map(|i| {
                let mut r = record("A", 0.1 * i as f64, 0.07 * i as f64, i % 2, 7 + i);
                r.transaction_date = 20170101 + i as u32;
                r
            })
            .collect();
        let cfg = TransactionAggregationConfig::default();
        let (forward, _) =
            aggregate_transactions(&base(&["A"]), "msno", records.clone(), &cfg).unwrap();
        records.reverse();
        let (backward, _) = aggregate_transactions(&base(&["A"]), "msno", records, &cfg).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn missing_transaction_columns_are_schema_errors() {
        let body = "msno,plan_list_price,actual_amount_paid\nA,1,1\n";
        let err = read_transactions_from(body.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Table(TableError::MissingColumn { ref column, .. }) if column == "is_cancel"
        ));
    }

    #[test]
    fn extra_transaction_columns_are_ignored() {
        let body = "msno,payment_method_id,payment_plan_days,plan_list_price,actual_amount_paid,is_auto_renew,transaction_date,membership_expire_date,is_cancel\n\
                    A,41,30,129,129,1,20150930,20151101,0\n";
        let records = read_transactions_from(body.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payment_plan_days, 30);
        assert_eq!(records[0].membership_expire_date, 20151101);
    }
}
