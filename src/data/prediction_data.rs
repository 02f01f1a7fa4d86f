use std::{path::Path, sync::Arc};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{config::EpicastConfig, error::EpicastError};

use super::{
    cache::MemoCache,
    ingest::{DataSource, RecordSource},
    location_index::{build_index, DisplayNameLookup, LocationIndexMap, LocationOption},
    prepare::{prepare, PreparedTable},
    record::RawRecord,
    window::{build_windows, PredictionWindow, PredictionWindows},
};

/// Everything derived from one download: the prepared table, its windows and
/// the selector index over the windowed locations.
#[derive(Debug)]
pub struct PredictionData {
    source: String,
    table: PreparedTable,
    windows: PredictionWindows,
    index: LocationIndexMap,
    built_at: DateTime<Utc>,
}

impl PredictionData {
    pub fn build(
        records: &[RawRecord],
        config: &EpicastConfig,
        source: impl Into<String>,
    ) -> Result<Self, EpicastError> {
        let table = prepare(records, &config.feature_spec())?;
        let windows = build_windows(&table, &config.window_spec())?;
        let index = build_index(&windows);
        Ok(Self {
            source: source.into(),
            table,
            windows,
            index,
            built_at: Utc::now(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn table(&self) -> &PreparedTable {
        &self.table
    }

    pub fn windows(&self) -> &PredictionWindows {
        &self.windows
    }

    pub fn index(&self) -> &LocationIndexMap {
        &self.index
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}

/// Selector options, or an empty list with the reason the data was unusable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationOptions {
    pub options: Vec<LocationOption>,
    pub reason: Option<String>,
}

/// One selected location, ready to hand to a forecasting model.
#[derive(Debug, Clone, Serialize)]
pub struct LocationSelection {
    pub index: usize,
    pub location: String,
    pub label: String,
    pub day_zero: Option<NaiveDate>,
    pub window: PredictionWindow,
}

/**
Serves prediction data to concurrent request handlers.

The expensive fetch → prepare → window → index chain runs at most once per source and
cache lifetime; all handlers share the resulting `Arc<PredictionData>`.
 */
pub struct PredictionService<S: RecordSource> {
    config: Arc<EpicastConfig>,
    records: Arc<S>,
    names: Arc<dyn DisplayNameLookup>,
    cache: MemoCache<String, PredictionData>,
}

impl<S: RecordSource> PredictionService<S> {
    pub fn new(config: EpicastConfig, records: S, names: Arc<dyn DisplayNameLookup>) -> Self {
        Self {
            config: Arc::new(config),
            records: Arc::new(records),
            names,
            cache: MemoCache::new(),
        }
    }

    pub fn config(&self) -> &EpicastConfig {
        &self.config
    }

    #[instrument(skip_all, fields(source = %source))]
    pub async fn prediction_data(
        &self,
        source: &DataSource,
    ) -> Result<Arc<PredictionData>, EpicastError> {
        let key = source.key();
        let config = self.config.clone();
        let records = self.records.clone();
        let source = source.clone();
        let build_key = key.clone();
        self.cache
            .get_or_build(key, self.config.cache_ttl(), move || async move {
                tokio::task::spawn_blocking(move || {
                    let raw = records.fetch(&source)?;
                    PredictionData::build(&raw, &config, build_key)
                })
                .await
                .map_err(|e| EpicastError::BuildAborted(e.to_string()))?
            })
            .await
    }

    /// Selector options for the windowed locations of `source`.
    pub async fn location_options(
        &self,
        source: &DataSource,
    ) -> Result<LocationOptions, EpicastError> {
        let data = match self.prediction_data(source).await {
            Ok(data) => data,
            Err(e) if e.is_empty_result() => {
                warn!("No selectable locations: {}", e);
                return Ok(LocationOptions {
                    options: Vec::new(),
                    reason: Some(e.to_string()),
                });
            }
            Err(e) => return Err(e),
        };
        let options = data
            .index()
            .options(self.names.as_ref(), &self.config.aggregate_prefix)?;
        Ok(LocationOptions {
            options,
            reason: None,
        })
    }

    /// Resolves a selector index to its location, label and window.
    pub async fn location_window(
        &self,
        source: &DataSource,
        index: usize,
    ) -> Result<LocationSelection, EpicastError> {
        let data = self.prediction_data(source).await?;
        let location = data.index().index_to_id(index)?;
        let label = data
            .index()
            .label(index, self.names.as_ref(), &self.config.aggregate_prefix)?;
        let window = data
            .windows()
            .get(location)
            .cloned()
            .ok_or_else(|| EpicastError::UnknownIdentifier(location.to_string()))?;
        Ok(LocationSelection {
            index,
            location: location.to_string(),
            label,
            day_zero: data.windows().day_zero(),
            window,
        })
    }

    /// Latest date of a local snapshot after preparation. Not cached.
    pub async fn latest_date(&self, path: &Path) -> Result<NaiveDate, EpicastError> {
        let source = DataSource::File(path.to_path_buf());
        let records = self.records.clone();
        let spec = self.config.feature_spec();
        let table = tokio::task::spawn_blocking(move || {
            let raw = records.fetch(&source)?;
            prepare(&raw, &spec)
        })
        .await
        .map_err(|e| EpicastError::BuildAborted(e.to_string()))??;
        let latest = table
            .latest_date()
            .ok_or_else(|| EpicastError::EmptyDataset(format!("{} has no rows", path.display())))?;
        info!("Latest date in {} is {}", path.display(), latest);
        Ok(latest)
    }

    pub async fn invalidate(&self, source: &DataSource) {
        self.cache.invalidate(&source.key()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::location_index::IsoNameTable,
        util::test_util::{daily_series, setup_series},
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    struct StaticSource {
        records: Mutex<Vec<RawRecord>>,
        fetches: AtomicUsize,
    }

    impl StaticSource {
        fn new(records: Vec<RawRecord>) -> Self {
            Self {
                records: Mutex::new(records),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    impl RecordSource for StaticSource {
        fn fetch(&self, _source: &DataSource) -> Result<Vec<RawRecord>, EpicastError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.lock().unwrap().clone())
        }
    }

    fn config() -> EpicastConfig {
        EpicastConfig {
            encoder_length: 10,
            prediction_length: 3,
            static_reals: vec![],
            time_varying_known_reals: vec!["stringency_index".to_string()],
            targets: vec!["new_cases".to_string()],
            ..Default::default()
        }
    }

    fn names() -> Arc<dyn DisplayNameLookup> {
        Arc::new(IsoNameTable::from_pairs([("DEU", "Germany"), ("FRA", "France")]))
    }

    fn records() -> Vec<RawRecord> {
        let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let mut records = daily_series("FRA", start, 20);
        records.extend(daily_series("DEU", start, 15));
        records.extend(daily_series("OWID_WRL", start, 30));
        records.extend(daily_series("ITA", start, 4));
        records
    }

    fn source() -> DataSource {
        DataSource::File("owid.json".into())
    }

    #[tokio::test]
    async fn test_options_follow_windowed_locations() {
        let service = PredictionService::new(config(), StaticSource::new(records()), names());
        let options = service.location_options(&source()).await.unwrap();
        assert_eq!(options.reason, None);
        assert_eq!(
            options.options,
            vec![
                LocationOption { label: "Germany".to_string(), value: 0 },
                LocationOption { label: "France".to_string(), value: 1 },
                LocationOption { label: "OWID_WRL".to_string(), value: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_location_window_resolves_index() {
        let (records, _guards) = setup_series(
            "location_window_resolves_index",
            NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            &[("FRA", 20), ("DEU", 15), ("OWID_WRL", 30), ("ITA", 4)],
        );
        let service = PredictionService::new(config(), StaticSource::new(records), names());
        let selection = service.location_window(&source(), 1).await.unwrap();
        assert_eq!(selection.location, "FRA");
        assert_eq!(selection.label, "France");
        assert_eq!(selection.window.encoder().len(), 10);
        assert_eq!(selection.window.decoder().len(), 3);
        assert_eq!(
            selection.day_zero,
            Some(NaiveDate::from_ymd_opt(2021, 1, 30).unwrap())
        );

        let out_of_range = service.location_window(&source(), 3).await;
        assert!(matches!(
            out_of_range,
            Err(EpicastError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[tokio::test]
    async fn test_fetch_is_shared_between_calls() {
        let service = Arc::new(PredictionService::new(
            config(),
            StaticSource::new(records()),
            names(),
        ));
        let calls = (0..8).map(|i| {
            let service = service.clone();
            async move { service.location_window(&source(), i % 3).await }
        });
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(service.records.fetches.load(Ordering::SeqCst), 1);

        service.invalidate(&source()).await;
        service.prediction_data(&source()).await.unwrap();
        assert_eq!(service.records.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_window_set_reported_with_reason() {
        let config = EpicastConfig {
            encoder_length: 100,
            ..config()
        };
        let service = PredictionService::new(config, StaticSource::new(records()), names());
        let options = service.location_options(&source()).await.unwrap();
        assert!(options.options.is_empty());
        assert!(options.reason.unwrap().contains("100"));
    }

    #[tokio::test]
    async fn test_failed_build_is_retried() {
        let service = PredictionService::new(config(), StaticSource::new(vec![]), names());
        let first = service.prediction_data(&source()).await;
        assert!(matches!(first, Err(EpicastError::EmptyDataset(_))));

        *service.records.records.lock().unwrap() = records();
        let data = service.prediction_data(&source()).await.unwrap();
        assert_eq!(data.index().len(), 3);
        assert_eq!(data.source(), "owid.json");
        assert_eq!(service.records.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_identifier_surfaces() {
        let names: Arc<dyn DisplayNameLookup> =
            Arc::new(IsoNameTable::from_pairs([("DEU", "Germany")]));
        let service = PredictionService::new(config(), StaticSource::new(records()), names);
        let result = service.location_options(&source()).await;
        assert!(matches!(result, Err(EpicastError::UnknownIdentifier(ref id)) if id == "FRA"));
    }

    #[tokio::test]
    async fn test_latest_date_of_snapshot() {
        let service = PredictionService::new(config(), StaticSource::new(records()), names());
        let latest = service.latest_date(Path::new("data/owid.json")).await.unwrap();
        assert_eq!(latest, NaiveDate::from_ymd_opt(2021, 1, 30).unwrap());
    }
}
