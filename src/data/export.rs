use std::io::Write;

use tracing::info;

use crate::error::EpicastError;

use super::{prepare::PreparedTable, window::PredictionWindows};

/// Fixed leading columns of the flattened window export.
const BASE_COLUMNS: [&str; 8] = [
    "location",
    "segment",
    "date",
    "time_idx",
    "continent",
    "tests_units",
    "month",
    "row_id",
];

/**
Write every window as one CSV row per time step: encoder rows, then decoder rows.

Numeric columns are the configured covariates and targets in configuration order, followed by
one `<field>_was_missing` column per indicator. Unobserved values (decoder targets) are empty.
 */
pub fn write_windows_csv<W: Write>(
    table: &PreparedTable,
    windows: &PredictionWindows,
    writer: W,
) -> Result<usize, EpicastError> {
    let fields = table.spec().covariate_fields();
    let indicators = table.indicator_fields();

    let mut writer = csv::Writer::from_writer(writer);
    let header: Vec<String> = BASE_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(fields.iter().map(|f| f.to_string()))
        .chain(table.indicator_columns())
        .collect();
    writer.write_record(&header)?;

    let mut rows = 0;
    for window in windows.iter() {
        for (segment, row) in window.rows() {
            let mut record = vec![
                row.location.clone(),
                segment.to_string(),
                row.date.to_string(),
                row.time_idx.to_string(),
                row.continent.clone(),
                row.tests_units.clone(),
                row.month.clone(),
                row.row_id.to_string(),
            ];
            record.extend(
                fields
                    .iter()
                    .map(|f| row.value(f).map(|v| v.to_string()).unwrap_or_default()),
            );
            record.extend(indicators.iter().map(|f| {
                row.was_missing(f)
                    .map(|m| m.to_string())
                    .unwrap_or_default()
            }));
            writer.write_record(&record)?;
            rows += 1;
        }
    }
    writer.flush()?;
    info!("Exported {} window rows", rows);
    Ok(rows)
}
