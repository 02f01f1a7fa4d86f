use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::EpicastError,
    util::date_utils::{days_since, month_label},
};

use super::record::RawRecord;

/// Continent category for rows without one (world and regional aggregates).
pub const GLOBAL_CONTINENT: &str = "Global";
/// Test-unit category for rows without one.
pub const MISSING_TESTS_UNITS: &str = "NA";
pub const WAS_MISSING_SUFFIX: &str = "_was_missing";

/// Which numeric fields the preparation step treats as model covariates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub static_reals: Vec<String>,
    pub time_varying_known_reals: Vec<String>,
    pub targets: Vec<String>,
    /// Fill missing targets with zero like the covariates. When false, rows
    /// with a missing target are dropped instead.
    pub impute_target: bool,
}

impl FeatureSpec {
    /// Static, known and target fields in that order, without duplicates.
    pub fn covariate_fields(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.static_reals
            .iter()
            .chain(&self.time_varying_known_reals)
            .chain(&self.targets)
            .map(String::as_str)
            .filter(|f| seen.insert(*f))
            .collect()
    }

    fn fill_fields(&self) -> BTreeSet<&str> {
        self.static_reals
            .iter()
            .chain(&self.time_varying_known_reals)
            .chain(self.targets.iter().filter(|_| self.impute_target))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedRow {
    /// Dense position in the prepared table. Synthetic decoder rows keep the id
    /// of the observed row they were projected from.
    pub row_id: usize,
    pub location: String,
    pub date: NaiveDate,
    pub time_idx: i64,
    pub continent: String,
    pub tests_units: String,
    pub month: String,
    pub values: BTreeMap<String, Option<f64>>,
    /// One entry per indicator field of the table.
    pub missing_flags: BTreeMap<String, bool>,
}

impl PreparedRow {
    pub fn value(&self, field: &str) -> Option<f64> {
        self.values
            .get(field)
            .copied()
            .flatten()
            .filter(|v| v.is_finite())
    }

    pub fn was_missing(&self, field: &str) -> Option<bool> {
        self.missing_flags.get(field).copied()
    }
}

/// Missing-value statistics of the raw table, gathered before imputation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MissingnessReport {
    pub rows: usize,
    pub columns: usize,
    pub missing_counts: BTreeMap<String, usize>,
    pub duplicate_rows: usize,
    pub dropped_missing_target: usize,
}

impl MissingnessReport {
    pub fn missing_share(&self, field: &str) -> Option<f64> {
        if self.rows == 0 {
            return None;
        }
        self.missing_counts
            .get(field)
            .map(|&count| count as f64 / self.rows as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTable {
    rows: Vec<PreparedRow>,
    origin: NaiveDate,
    indicator_fields: Vec<String>,
    spec: FeatureSpec,
    report: MissingnessReport,
}

impl PreparedTable {
    pub fn rows(&self) -> &[PreparedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Earliest date of the raw table; `time_idx` 0.
    pub fn origin(&self) -> NaiveDate {
        self.origin
    }

    /// Covariates that had at least one missing value and therefore carry a
    /// was-missing flag on every row.
    pub fn indicator_fields(&self) -> &[String] {
        &self.indicator_fields
    }

    pub fn indicator_columns(&self) -> Vec<String> {
        self.indicator_fields
            .iter()
            .map(|f| format!("{}{}", f, WAS_MISSING_SUFFIX))
            .collect()
    }

    pub fn spec(&self) -> &FeatureSpec {
        &self.spec
    }

    pub fn report(&self) -> &MissingnessReport {
        &self.report
    }

    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.rows.iter().map(|r| r.date).max()
    }

    pub fn has_column(&self, field: &str) -> bool {
        self.report.missing_counts.contains_key(field)
    }
}

/**
Clean, impute and index a raw report table.

1. `time_idx` is the day offset from the earliest date in the whole table.
2. Missing continent / test units become `Global` / `NA`; a month category is derived.
3. Every covariate with a missing value anywhere gets a was-missing flag, then the
   configured fields are filled with zero.
4. Rows whose target is still missing are dropped.
5. Rows are ordered by (location, date) and renumbered densely.

The input is not modified. Duplicate (location, date) records keep the last occurrence.

## Errors
* `DataFormat` if a record has an empty location or a configured field is absent from every record.
* `EmptyDataset` if no rows remain.
 */
#[instrument(skip(records, spec), fields(records = records.len()))]
pub fn prepare(records: &[RawRecord], spec: &FeatureSpec) -> Result<PreparedTable, EpicastError> {
    let origin = records
        .iter()
        .map(|r| r.date)
        .min()
        .ok_or_else(|| EpicastError::EmptyDataset("the raw table has no rows".to_string()))?;

    if let Some(record) = records.iter().find(|r| r.location.trim().is_empty()) {
        return Err(EpicastError::DataFormat(format!(
            "record dated {} has an empty location",
            record.date
        )));
    }

    let report = missingness(records);
    for field in spec.covariate_fields() {
        if !report.missing_counts.contains_key(field) {
            return Err(EpicastError::DataFormat(format!(
                "required column `{}` is absent from the table",
                field
            )));
        }
    }

    let indicator_fields: Vec<String> = spec
        .covariate_fields()
        .into_iter()
        .filter(|f| report.missing_counts.get(*f).copied().unwrap_or(0) > 0)
        .map(str::to_string)
        .collect();
    let fill_fields = spec.fill_fields();
    debug!(
        "Origin {}, indicator columns {:?}, filling {:?}",
        origin, indicator_fields, fill_fields
    );

    // Latest occurrence wins for duplicate (location, date) keys.
    let mut by_key: BTreeMap<(&str, NaiveDate), &RawRecord> = BTreeMap::new();
    for record in records {
        by_key.insert((record.location.as_str(), record.date), record);
    }
    let duplicate_rows = records.len() - by_key.len();
    if duplicate_rows > 0 {
        warn!("Dropped {} duplicate (location, date) records", duplicate_rows);
    }

    let mut rows = Vec::with_capacity(by_key.len());
    let mut dropped_missing_target = 0;
    for record in by_key.into_values() {
        let row = prepare_row(record, origin, &indicator_fields, &fill_fields);
        if spec.targets.iter().any(|t| row.value(t).is_none()) {
            dropped_missing_target += 1;
            continue;
        }
        rows.push(row);
    }
    for (row_id, row) in rows.iter_mut().enumerate() {
        row.row_id = row_id;
    }

    if dropped_missing_target > 0 {
        info!("Dropped {} rows with a missing target", dropped_missing_target);
    }
    if rows.is_empty() {
        return Err(EpicastError::EmptyDataset(format!(
            "all {} rows have a missing target",
            dropped_missing_target
        )));
    }

    info!(
        "Prepared {} rows for {} locations",
        rows.len(),
        rows.iter().map(|r| r.location.as_str()).collect::<BTreeSet<_>>().len()
    );

    Ok(PreparedTable {
        rows,
        origin,
        indicator_fields,
        spec: spec.clone(),
        report: MissingnessReport {
            duplicate_rows,
            dropped_missing_target,
            ..report
        },
    })
}

fn missingness(records: &[RawRecord]) -> MissingnessReport {
    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.values.keys().map(String::as_str))
        .collect();
    let missing_counts = columns
        .iter()
        .map(|&field| {
            let missing = records.iter().filter(|r| r.value(field).is_none()).count();
            (field.to_string(), missing)
        })
        .collect();
    MissingnessReport {
        rows: records.len(),
        columns: columns.len(),
        missing_counts,
        ..Default::default()
    }
}

fn prepare_row(
    record: &RawRecord,
    origin: NaiveDate,
    indicator_fields: &[String],
    fill_fields: &BTreeSet<&str>,
) -> PreparedRow {
    let missing_flags = indicator_fields
        .iter()
        .map(|f| (f.clone(), record.value(f).is_none()))
        .collect();

    let mut values: BTreeMap<String, Option<f64>> = record
        .values
        .iter()
        .map(|(k, v)| (k.clone(), v.filter(|x| x.is_finite())))
        .collect();
    for field in fill_fields {
        let slot = values.entry(field.to_string()).or_insert(None);
        if slot.is_none() {
            *slot = Some(0.0);
        }
    }

    PreparedRow {
        row_id: 0,
        location: record.location.clone(),
        date: record.date,
        time_idx: days_since(record.date, origin),
        continent: record
            .continent
            .clone()
            .unwrap_or_else(|| GLOBAL_CONTINENT.to_string()),
        tests_units: record
            .tests_units
            .clone()
            .unwrap_or_else(|| MISSING_TESTS_UNITS.to_string()),
        month: month_label(record.date),
        values,
        missing_flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::record::RawRecordBuilder;

    fn spec() -> FeatureSpec {
        FeatureSpec {
            static_reals: vec!["population".to_string()],
            time_varying_known_reals: vec!["stringency_index".to_string()],
            targets: vec!["new_cases".to_string()],
            impute_target: true,
        }
    }

    fn record(location: &str, day: u32, cases: Option<f64>, stringency: Option<f64>) -> RawRecord {
        RawRecordBuilder::default()
            .location(location)
            .date(NaiveDate::from_ymd_opt(2021, 1, day).unwrap())
            .value("population", Some(1000.0))
            .value("new_cases", cases)
            .value("stringency_index", stringency)
            .build()
            .unwrap()
    }

    #[test]
    fn test_time_idx_from_global_origin() {
        let records = vec![
            record("B", 5, Some(1.0), Some(1.0)),
            record("A", 3, Some(1.0), Some(1.0)),
            record("A", 4, Some(1.0), Some(1.0)),
            record("B", 7, Some(1.0), Some(1.0)),
        ];
        let table = prepare(&records, &spec()).unwrap();
        assert_eq!(table.origin(), NaiveDate::from_ymd_opt(2021, 1, 3).unwrap());
        let idx: Vec<(&str, i64)> = table
            .rows()
            .iter()
            .map(|r| (r.location.as_str(), r.time_idx))
            .collect();
        assert_eq!(idx, vec![("A", 0), ("A", 1), ("B", 2), ("B", 4)]);
        let ids: Vec<usize> = table.rows().iter().map(|r| r.row_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_categorical_sentinels_and_month() {
        let mut with_continent = record("DEU", 31, Some(1.0), Some(1.0));
        with_continent.continent = Some("Europe".to_string());
        with_continent.tests_units = Some("tests performed".to_string());
        let records = vec![record("OWID_WRL", 31, Some(1.0), Some(1.0)), with_continent];
        let table = prepare(&records, &spec()).unwrap();

        let deu = &table.rows()[0];
        assert_eq!(deu.continent, "Europe");
        assert_eq!(deu.tests_units, "tests performed");
        let world = &table.rows()[1];
        assert_eq!(world.continent, GLOBAL_CONTINENT);
        assert_eq!(world.tests_units, MISSING_TESTS_UNITS);
        assert_eq!(world.month, "1");
    }

    #[test]
    fn test_indicator_only_for_columns_with_missing_values() {
        let records = vec![
            record("A", 1, Some(1.0), None),
            record("A", 2, Some(2.0), Some(3.0)),
        ];
        let table = prepare(&records, &spec()).unwrap();
        assert_eq!(table.indicator_fields(), &["stringency_index".to_string()]);
        assert_eq!(
            table.indicator_columns(),
            vec!["stringency_index_was_missing".to_string()]
        );

        let first = &table.rows()[0];
        assert_eq!(first.was_missing("stringency_index"), Some(true));
        assert_eq!(first.value("stringency_index"), Some(0.0));
        assert_eq!(first.was_missing("population"), None);
        assert_eq!(table.rows()[1].was_missing("stringency_index"), Some(false));
        assert_eq!(table.rows()[1].value("stringency_index"), Some(3.0));
    }

    #[test]
    fn test_target_is_imputed_by_default() {
        let records = vec![
            record("A", 1, None, Some(1.0)),
            record("A", 2, Some(2.0), Some(1.0)),
        ];
        let table = prepare(&records, &spec()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].value("new_cases"), Some(0.0));
        assert_eq!(table.rows()[0].was_missing("new_cases"), Some(true));
        assert_eq!(table.report().dropped_missing_target, 0);
    }

    #[test]
    fn test_missing_target_rows_dropped_without_imputation() {
        let spec = FeatureSpec {
            impute_target: false,
            ..spec()
        };
        let records = vec![
            record("A", 1, None, Some(1.0)),
            record("A", 2, Some(2.0), Some(1.0)),
            record("A", 3, Some(f64::NAN), Some(1.0)),
        ];
        let table = prepare(&records, &spec).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows()[0].row_id, 0);
        assert_eq!(table.rows()[0].value("new_cases"), Some(2.0));
        assert_eq!(table.report().dropped_missing_target, 2);
    }

    #[test]
    fn test_all_targets_missing_is_empty_dataset() {
        let spec = FeatureSpec {
            impute_target: false,
            ..spec()
        };
        let records = vec![record("A", 1, None, Some(1.0))];
        assert!(matches!(
            prepare(&records, &spec),
            Err(EpicastError::EmptyDataset(_))
        ));
        assert!(matches!(
            prepare(&[], &spec),
            Err(EpicastError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_absent_target_column_is_data_format_error() {
        let records = vec![RawRecordBuilder::default()
            .location("A")
            .date(NaiveDate::from_ymd_opt(2021, 1, 1).unwrap())
            .value("population", Some(1.0))
            .value("stringency_index", Some(1.0))
            .build()
            .unwrap()];
        assert!(matches!(
            prepare(&records, &spec()),
            Err(EpicastError::DataFormat(_))
        ));
    }

    #[test]
    fn test_empty_location_is_data_format_error() {
        let records = vec![record(" ", 1, Some(1.0), Some(1.0))];
        assert!(matches!(
            prepare(&records, &spec()),
            Err(EpicastError::DataFormat(_))
        ));
    }

    #[test]
    fn test_duplicates_keep_last_and_input_untouched() {
        let records = vec![
            record("A", 1, Some(1.0), None),
            record("A", 1, Some(9.0), None),
        ];
        let snapshot = records.clone();
        let table = prepare(&records, &spec()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows()[0].value("new_cases"), Some(9.0));
        assert_eq!(table.report().duplicate_rows, 1);
        assert_eq!(records, snapshot);
    }

    #[test]
    fn test_missingness_report() {
        let records = vec![
            record("A", 1, Some(1.0), None),
            record("A", 2, Some(1.0), None),
            record("A", 3, Some(1.0), Some(2.0)),
            record("A", 4, Some(1.0), Some(2.0)),
        ];
        let table = prepare(&records, &spec()).unwrap();
        let report = table.report();
        assert_eq!(report.rows, 4);
        assert_eq!(report.columns, 3);
        assert_eq!(report.missing_counts["stringency_index"], 2);
        assert_eq!(report.missing_share("stringency_index"), Some(0.5));
        assert_eq!(report.missing_share("new_cases"), Some(0.0));
        assert_eq!(report.missing_share("unknown"), None);
        assert_eq!(
            table.latest_date(),
            Some(NaiveDate::from_ymd_opt(2021, 1, 4).unwrap())
        );
    }

    #[test]
    fn test_covariate_fields_deduplicated() {
        let spec = FeatureSpec {
            static_reals: vec!["a".to_string(), "b".to_string()],
            time_varying_known_reals: vec!["b".to_string(), "c".to_string()],
            targets: vec!["a".to_string()],
            impute_target: true,
        };
        assert_eq!(spec.covariate_fields(), vec!["a", "b", "c"]);
    }
}
