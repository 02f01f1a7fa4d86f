use std::fs;

use chrono::NaiveDate;
use tracing::{info, subscriber::DefaultGuard};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::data::record::{RawRecord, RawRecordBuilder};

use super::date_utils::add_days;

pub const TEST_LOG_DIR: &str = "tests/logs";

/// Keeps a test's thread-local subscriber installed and its log file flushing.
pub struct TracingGuards {
    _subscriber_guard: DefaultGuard,
    _worker_guard: WorkerGuard,
}

/// Routes `epicast` events of the current thread to `tests/logs/<test_name>.log`.
///
/// The subscriber is thread-local, so parallel tests write to their own files. Tests on a
/// multi-threaded runtime only capture events emitted on the test thread.
pub fn setup_test_tracing(test_name: &str) -> TracingGuards {
    fs::create_dir_all(TEST_LOG_DIR).unwrap();
    let file_appender =
        tracing_appender::rolling::never(TEST_LOG_DIR, format!("{}.log", test_name));
    let (writer, worker_guard) = tracing_appender::non_blocking(file_appender);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_filter(EnvFilter::new("epicast=debug"));
    let subscriber_guard = tracing::subscriber::set_default(Registry::default().with(layer));
    info!("===== {} =====", test_name);

    TracingGuards {
        _subscriber_guard: subscriber_guard,
        _worker_guard: worker_guard,
    }
}

/// `days` consecutive daily records for `location` starting at `start`, with
/// `new_cases` counting up from zero and a constant `stringency_index`.
pub fn daily_series(location: &str, start: NaiveDate, days: u64) -> Vec<RawRecord> {
    (0..days)
        .map(|d| {
            RawRecordBuilder::default()
                .location(location)
                .date(add_days(start, d).unwrap())
                .value("new_cases", Some(d as f64))
                .value("stringency_index", Some(42.0))
                .build()
                .unwrap()
        })
        .collect()
}

/// Installs test tracing and returns one daily series per `(location, days)` pair, all
/// starting on `start`.
pub fn setup_series(
    test_name: &str,
    start: NaiveDate,
    locations: &[(&str, u64)],
) -> (Vec<RawRecord>, TracingGuards) {
    let guards = setup_test_tracing(test_name);
    let records: Vec<RawRecord> = locations
        .iter()
        .flat_map(|(location, days)| daily_series(location, start, *days))
        .collect();
    info!("Fixture with {} records over {} locations", records.len(), locations.len());
    (records, guards)
}
