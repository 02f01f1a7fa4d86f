use std::{collections::BTreeMap, fmt};

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    error::EpicastError,
    util::date_utils::{add_days, days_since, month_label},
};

use super::prepare::{PreparedRow, PreparedTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub encoder_length: usize,
    pub prediction_length: usize,
    pub targets: Vec<String>,
}

impl WindowSpec {
    /// Minimum number of observations a location needs to be windowed.
    pub fn required_observations(&self) -> usize {
        self.encoder_length.max(self.prediction_length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Encoder,
    Decoder,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Encoder => write!(f, "encoder"),
            Segment::Decoder => write!(f, "decoder"),
        }
    }
}

/// Encoder history followed by synthetic decoder days for one location.
///
/// Decoder rows carry the covariates of the last observed row forward and
/// have every target field set to `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionWindow {
    location: String,
    encoder: Vec<PreparedRow>,
    decoder: Vec<PreparedRow>,
}

impl PredictionWindow {
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn encoder(&self) -> &[PreparedRow] {
        &self.encoder
    }

    pub fn decoder(&self) -> &[PreparedRow] {
        &self.decoder
    }

    pub fn len(&self) -> usize {
        self.encoder.len() + self.decoder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoder.is_empty() && self.decoder.is_empty()
    }

    /// Encoder rows then decoder rows, tagged with their segment.
    pub fn rows(&self) -> impl Iterator<Item = (Segment, &PreparedRow)> {
        self.encoder
            .iter()
            .map(|r| (Segment::Encoder, r))
            .chain(self.decoder.iter().map(|r| (Segment::Decoder, r)))
    }

    pub fn last_observed_date(&self) -> Option<NaiveDate> {
        self.encoder.last().map(|r| r.date)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionWindows {
    windows: Vec<PredictionWindow>,
    excluded: Vec<String>,
    spec: WindowSpec,
}

impl PredictionWindows {
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PredictionWindow> {
        self.windows.iter()
    }

    /// Retained locations in lexicographic order.
    pub fn locations(&self) -> impl Iterator<Item = &str> {
        self.windows.iter().map(|w| w.location())
    }

    pub fn get(&self, location: &str) -> Option<&PredictionWindow> {
        self.windows
            .binary_search_by(|w| w.location.as_str().cmp(location))
            .ok()
            .map(|i| &self.windows[i])
    }

    /// Locations dropped for having too few observations.
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn spec(&self) -> &WindowSpec {
        &self.spec
    }

    /// Latest observed date across all windows; forecasts start the day after.
    pub fn day_zero(&self) -> Option<NaiveDate> {
        self.windows
            .iter()
            .filter_map(PredictionWindow::last_observed_date)
            .max()
    }
}

/**
Derive one encoder/decoder window per location from a prepared table.

Locations with fewer observations than `encoder_length` or `prediction_length` are excluded
entirely. The decoder repeats the last observed row `prediction_length` times, one day apart,
with its month recomputed and its targets cleared; its `time_idx` starts exactly one after
the encoder's last.

## Errors
* `DataFormat` if a target field is not a column of the table.
* `EmptyWindowSet` if every location is excluded.
 */
#[instrument(skip(table, spec), fields(rows = table.len(), encoder = spec.encoder_length, decoder = spec.prediction_length))]
pub fn build_windows(
    table: &PreparedTable,
    spec: &WindowSpec,
) -> Result<PredictionWindows, EpicastError> {
    if let Some(missing) = spec.targets.iter().find(|t| !table.has_column(t)) {
        return Err(EpicastError::DataFormat(format!(
            "target column `{}` is absent from the prepared table",
            missing
        )));
    }

    let mut groups: BTreeMap<&str, Vec<&PreparedRow>> = BTreeMap::new();
    for row in table.rows() {
        groups.entry(row.location.as_str()).or_default().push(row);
    }
    let groups: Vec<(&str, Vec<&PreparedRow>)> = groups.into_iter().collect();
    let total = groups.len();

    let required = spec.required_observations();
    let built: Vec<Result<PredictionWindow, String>> = groups
        .into_par_iter()
        .map(|(location, rows)| {
            if rows.len() < required {
                debug!(
                    "Excluding {} with {} observations (need {})",
                    location,
                    rows.len(),
                    required
                );
                Ok(Err(location.to_string()))
            } else {
                location_window(location, rows, table.origin(), spec).map(Ok)
            }
        })
        .collect::<Result<Vec<_>, EpicastError>>()?;

    let mut windows = Vec::with_capacity(built.len());
    let mut excluded = Vec::new();
    for window in built {
        match window {
            Ok(window) => windows.push(window),
            Err(location) => excluded.push(location),
        }
    }

    if windows.is_empty() {
        return Err(EpicastError::EmptyWindowSet {
            encoder_length: spec.encoder_length,
            prediction_length: spec.prediction_length,
            required,
            locations: total,
        });
    }

    info!(
        "Built {} windows, excluded {} locations",
        windows.len(),
        excluded.len()
    );
    Ok(PredictionWindows {
        windows,
        excluded,
        spec: spec.clone(),
    })
}

fn location_window(
    location: &str,
    mut rows: Vec<&PreparedRow>,
    origin: NaiveDate,
    spec: &WindowSpec,
) -> Result<PredictionWindow, EpicastError> {
    rows.sort_by_key(|r| r.time_idx);
    let encoder: Vec<PreparedRow> = rows[rows.len() - spec.encoder_length..]
        .iter()
        .map(|r| (*r).clone())
        .collect();

    let last = encoder.last().ok_or_else(|| {
        EpicastError::DataFormat(format!("location {} has an empty encoder", location))
    })?;
    let mut decoder = Vec::with_capacity(spec.prediction_length);
    for step in 1..=spec.prediction_length {
        let mut row = last.clone();
        row.date = add_days(last.date, step as u64)?;
        row.time_idx = days_since(row.date, origin);
        row.month = month_label(row.date);
        for target in &spec.targets {
            row.values.insert(target.clone(), None);
        }
        decoder.push(row);
    }

    // Anchor the decoder right after the encoder regardless of the calendar offset.
    if let Some(first) = decoder.first().map(|r| r.time_idx) {
        let shift = last.time_idx + 1 - first;
        for row in &mut decoder {
            row.time_idx += shift;
        }
    }

    Ok(PredictionWindow {
        location: location.to_string(),
        encoder,
        decoder,
    })
}
