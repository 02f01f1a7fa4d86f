use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::{error::EpicastError, util::date_utils::parse_date};

use super::record::RawRecord;

const DATA_KEY: &str = "data";
const DATE_KEY: &str = "date";
const CONTINENT_KEY: &str = "continent";
const TESTS_UNITS_KEY: &str = "tests_units";
const ISO_CODE_KEY: &str = "iso_code";
/// Display name column; the identifier comes from the object key / `iso_code`.
const LOCATION_NAME_KEY: &str = "location";
/// CSV columns that are never read as numbers.
const CSV_TEXT_COLUMNS: &[&str] = &[
    ISO_CODE_KEY,
    DATE_KEY,
    CONTINENT_KEY,
    TESTS_UNITS_KEY,
    LOCATION_NAME_KEY,
];

/// Where raw records come from. The display string doubles as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataSource {
    Url(String),
    File(PathBuf),
}

impl DataSource {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            DataSource::Url(trimmed.to_string())
        } else {
            DataSource::File(PathBuf::from(trimmed))
        }
    }

    pub fn key(&self) -> String {
        self.to_string()
    }

    fn format(&self) -> PayloadFormat {
        match self {
            DataSource::Url(url) => PayloadFormat::from_name(url),
            DataSource::File(path) => PayloadFormat::from_name(&path.to_string_lossy()),
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Url(url) => write!(f, "{}", url),
            DataSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Csv,
}

impl PayloadFormat {
    pub fn from_name(name: &str) -> Self {
        let path = name.split(['?', '#']).next().unwrap_or(name);
        if path.to_ascii_lowercase().ends_with(".csv") {
            PayloadFormat::Csv
        } else {
            PayloadFormat::Json
        }
    }
}

/// Capability to turn a [`DataSource`] into raw records.
pub trait RecordSource: Send + Sync + 'static {
    fn fetch(&self, source: &DataSource) -> Result<Vec<RawRecord>, EpicastError>;
}

/// Reads the Our World in Data per-location report, either over HTTP or from
/// a local snapshot.
#[derive(Debug, Clone)]
pub struct OwidSource {
    timeout: Duration,
}

impl OwidSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn fetch_url(&self, url: &str, format: PayloadFormat) -> Result<Vec<RawRecord>, EpicastError> {
        info!("Downloading {}", url);
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        let response = agent
            .get(url)
            .call()
            .map_err(|e| EpicastError::Network(format!("GET {} failed: {}", url, e)))?;
        parse_payload(response.into_reader(), format)
    }

    fn read_file(
        &self,
        path: &Path,
        format: PayloadFormat,
    ) -> Result<Vec<RawRecord>, EpicastError> {
        info!("Reading snapshot {}", path.display());
        let file = File::open(path)?;
        parse_payload(BufReader::new(file), format)
    }
}

impl Default for OwidSource {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl RecordSource for OwidSource {
    #[instrument(skip_all, fields(source = %source))]
    fn fetch(&self, source: &DataSource) -> Result<Vec<RawRecord>, EpicastError> {
        let format = source.format();
        let records = match source {
            DataSource::Url(url) => self.fetch_url(url, format)?,
            DataSource::File(path) => self.read_file(path, format)?,
        };
        info!("Fetched {} raw records", records.len());
        Ok(records)
    }
}

fn parse_payload<R: Read>(
    reader: R,
    format: PayloadFormat,
) -> Result<Vec<RawRecord>, EpicastError> {
    match format {
        PayloadFormat::Json => parse_owid_json(reader),
        PayloadFormat::Csv => parse_owid_csv(reader),
    }
}

/**
Parse the OWID JSON layout: an object keyed by location identifier, each value holding
static fields plus a `data` array of daily objects.

Static numeric fields are joined onto every daily record of their location. Daily values
win over static values of the same name.

## Errors
* `Parse` if the payload is not valid JSON of that shape or a date is malformed.
* `Network` if the underlying reader fails mid-transfer.
* `Schema` if a location lacks `data` or a day lacks `date`.
 */
pub fn parse_owid_json<R: Read>(reader: R) -> Result<Vec<RawRecord>, EpicastError> {
    let payload: Value = serde_json::from_reader(reader).map_err(|e| {
        if e.is_io() {
            EpicastError::Network(format!("payload transfer interrupted: {}", e))
        } else {
            EpicastError::parse("OWID JSON payload", e)
        }
    })?;
    let locations = payload
        .as_object()
        .ok_or_else(|| EpicastError::parse("OWID JSON payload", "top level is not an object"))?;

    let mut records = Vec::new();
    for (location, entry) in locations {
        let entry = entry.as_object().ok_or_else(|| {
            EpicastError::parse(format!("entry for {}", location), "not an object")
        })?;
        let days = entry
            .get(DATA_KEY)
            .and_then(Value::as_array)
            .ok_or_else(|| EpicastError::Schema {
                context: format!("Location {}", location),
                field: DATA_KEY.to_string(),
            })?;

        let (static_values, continent) = static_fields(entry);
        for day in days {
            let day = day.as_object().ok_or_else(|| {
                EpicastError::parse(format!("daily entry for {}", location), "not an object")
            })?;
            records.push(daily_record(location, day, &static_values, &continent)?);
        }
    }
    Ok(records)
}

fn static_fields(entry: &Map<String, Value>) -> (BTreeMap<String, Option<f64>>, Option<String>) {
    let mut values = BTreeMap::new();
    let mut continent = None;
    for (key, value) in entry {
        match (key.as_str(), value) {
            (DATA_KEY, _) | (LOCATION_NAME_KEY, _) => {}
            (CONTINENT_KEY, Value::String(s)) => continent = Some(s.clone()),
            (_, Value::Number(n)) => {
                values.insert(key.clone(), n.as_f64());
            }
            (_, Value::Null) => {
                values.insert(key.clone(), None);
            }
            _ => {}
        }
    }
    (values, continent)
}

fn daily_record(
    location: &str,
    day: &Map<String, Value>,
    static_values: &BTreeMap<String, Option<f64>>,
    continent: &Option<String>,
) -> Result<RawRecord, EpicastError> {
    let date = day
        .get(DATE_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| EpicastError::Schema {
            context: format!("Daily record for {}", location),
            field: DATE_KEY.to_string(),
        })?;
    let date = parse_date(date)
        .map_err(|e| EpicastError::parse(format!("date `{}` for {}", date, location), e))?;

    let mut values = static_values.clone();
    let mut tests_units = None;
    for (key, value) in day {
        match (key.as_str(), value) {
            (DATE_KEY, _) => {}
            (TESTS_UNITS_KEY, Value::String(s)) => tests_units = Some(s.clone()),
            (_, Value::Number(n)) => {
                values.insert(key.clone(), n.as_f64());
            }
            (_, Value::Null) => {
                values.insert(key.clone(), None);
            }
            (_, other) => {
                debug!("Ignoring non-numeric field {} ({}) for {}", key, other, location);
            }
        }
    }

    Ok(RawRecord {
        location: location.to_string(),
        date,
        continent: continent.clone(),
        tests_units,
        values,
    })
}

/**
Parse the OWID CSV layout: one row per (iso_code, date) with `continent` and `tests_units`
as text columns and every other column numeric. Empty cells are missing values.
 */
pub fn parse_owid_csv<R: Read>(reader: R) -> Result<Vec<RawRecord>, EpicastError> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers().map_err(csv_payload_error)?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| EpicastError::Schema {
                context: "CSV header".to_string(),
                field: name.to_string(),
            })
    };
    let location_idx = column(ISO_CODE_KEY)?;
    let date_idx = column(DATE_KEY)?;
    let continent_idx = headers.iter().position(|h| h == CONTINENT_KEY);
    let tests_units_idx = headers.iter().position(|h| h == TESTS_UNITS_KEY);
    let numeric: Vec<(usize, &str)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !CSV_TEXT_COLUMNS.contains(h))
        .collect();

    let text = |row: &csv::StringRecord, idx: Option<usize>| {
        idx.and_then(|i| row.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(csv_payload_error)?;
        let location = text(&row, Some(location_idx)).ok_or_else(|| EpicastError::Schema {
            context: format!("CSV row {}", line + 1),
            field: ISO_CODE_KEY.to_string(),
        })?;
        let date = text(&row, Some(date_idx)).ok_or_else(|| EpicastError::Schema {
            context: format!("CSV row {} ({})", line + 1, location),
            field: DATE_KEY.to_string(),
        })?;
        let date = parse_date(&date)
            .map_err(|e| EpicastError::parse(format!("date `{}` for {}", date, location), e))?;

        let mut values = BTreeMap::new();
        for (idx, name) in &numeric {
            let cell = row.get(*idx).map(str::trim).unwrap_or("");
            let value = if cell.is_empty() {
                None
            } else {
                Some(cell.parse::<f64>().map_err(|e| {
                    EpicastError::parse(format!("{} for {} on {}", name, location, date), e)
                })?)
            };
            values.insert(name.to_string(), value);
        }

        records.push(RawRecord {
            continent: text(&row, continent_idx),
            tests_units: text(&row, tests_units_idx),
            location,
            date,
            values,
        });
    }
    if records.is_empty() {
        warn!("CSV payload contained a header but no rows");
    }
    Ok(records)
}

/// Transfer failures are `Network`; anything the CSV reader rejects is `Parse`.
fn csv_payload_error(e: csv::Error) -> EpicastError {
    if e.is_io_error() {
        EpicastError::Network(format!("payload transfer interrupted: {}", e))
    } else {
        EpicastError::parse("OWID CSV payload", e)
    }
}
