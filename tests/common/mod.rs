#![allow(dead_code)]

use std::{io::Write, sync::Arc, time::Duration};

use chrono::NaiveDate;
use epicast::{
    config::EpicastConfig,
    data::{
        ingest::OwidSource,
        location_index::{DisplayNameLookup, IsoNameTable},
        prediction_data::PredictionService,
    },
    util::{date_utils::add_days, test_util::{setup_test_tracing, TracingGuards}},
};
use serde_json::{json, Value};
use tempfile::{Builder, NamedTempFile};

pub const START: (i32, u32, u32) = (2020, 3, 1);

pub fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(START.0, START.1, START.2).unwrap()
}

/// One location of a synthetic OWID snapshot.
pub struct LocationSpec<'a> {
    pub id: &'a str,
    pub days: u64,
    /// Day offsets whose `stringency_index` is null.
    pub missing_stringency: &'a [u64],
}

pub fn owid_payload(locations: &[LocationSpec]) -> Value {
    let mut payload = serde_json::Map::new();
    for location in locations {
        let data: Vec<Value> = (0..location.days)
            .map(|d| {
                let stringency = if location.missing_stringency.contains(&d) {
                    Value::Null
                } else {
                    json!(50.0)
                };
                json!({
                    "date": add_days(start(), d).unwrap().format("%Y-%m-%d").to_string(),
                    "new_cases": d as f64,
                    "stringency_index": stringency,
                    "tests_units": "tests performed",
                })
            })
            .collect();
        payload.insert(
            location.id.to_string(),
            json!({
                "continent": "Europe",
                "location": format!("Location {}", location.id),
                "population": 1_000_000.0,
                "data": data,
            }),
        );
    }
    Value::Object(payload)
}

pub fn write_snapshot(payload: &Value) -> NamedTempFile {
    let mut file = Builder::new().suffix(".json").tempfile().unwrap();
    serde_json::to_writer(&mut file, payload).unwrap();
    file.flush().unwrap();
    file
}

pub fn config(encoder_length: usize, prediction_length: usize) -> EpicastConfig {
    EpicastConfig {
        encoder_length,
        prediction_length,
        static_reals: vec!["population".to_string()],
        time_varying_known_reals: vec!["stringency_index".to_string()],
        targets: vec!["new_cases".to_string()],
        ..Default::default()
    }
}

pub fn names() -> Arc<dyn DisplayNameLookup> {
    Arc::new(IsoNameTable::from_pairs([
        ("A", "Alphaland"),
        ("B", "Betaland"),
    ]))
}

pub fn service(
    config: EpicastConfig,
    test_name: &str,
) -> (PredictionService<OwidSource>, TracingGuards) {
    let guards = setup_test_tracing(test_name);
    let service = PredictionService::new(config, OwidSource::new(Duration::from_secs(5)), names());
    (service, guards)
}
