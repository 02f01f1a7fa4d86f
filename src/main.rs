use std::{error::Error, fs::File, io::{self, BufWriter, Write}, sync::Arc};

use clap::Parser;
use epicast::{
    args::Args,
    config::EpicastConfig,
    data::{
        export::write_windows_csv,
        ingest::{OwidSource, RecordSource},
        location_index::{DisplayNameLookup, IsoNameTable},
        prediction_data::PredictionService,
    },
    error::EpicastError,
    logging::setup_tracing,
};
use tracing::{info, warn};

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let _guard = setup_tracing(Some(args.log_dir.as_str()))?;

    let mut config = EpicastConfig::read_config(Some(&args.config))?;
    if let Some(source) = &args.source {
        config.source = source.clone();
    }

    let names: Arc<dyn DisplayNameLookup> = if config.iso_names.exists() {
        Arc::new(IsoNameTable::from_path(&config.iso_names)?)
    } else {
        warn!(
            "Display name table {} not found; only aggregates can be labelled",
            config.iso_names.display()
        );
        Arc::new(IsoNameTable::default())
    };
    let records = OwidSource::new(config.http_timeout());
    let service = PredictionService::new(config, records, names);

    run(&args, &service, &mut io::stdout().lock()).await?;
    Ok(())
}

/// Builds the prediction data once and prints what `args` asks for. A dataset that filters
/// down to nothing is reported with its reason rather than failing the run.
async fn run<S: RecordSource>(
    args: &Args,
    service: &PredictionService<S>,
    out: &mut impl Write,
) -> Result<(), EpicastError> {
    let source = service.config().data_source();
    let data = match service.prediction_data(&source).await {
        Ok(data) => data,
        Err(e) if e.is_empty_result() => {
            warn!("No prediction data for {}: {}", source, e);
            writeln!(out, "No locations: {}", e)?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    info!(
        "Prepared {} rows; {} locations windowed, {} excluded",
        data.table().len(),
        data.windows().len(),
        data.windows().excluded().len()
    );

    if args.report {
        let report = data.table().report();
        writeln!(
            out,
            "Raw table: {} rows, {} numeric columns, {} duplicates, {} dropped for a missing target",
            report.rows, report.columns, report.duplicate_rows, report.dropped_missing_target
        )?;
        for (field, count) in &report.missing_counts {
            if *count > 0 {
                writeln!(
                    out,
                    "{:<40} {:>10} missing ({:.1}%)",
                    field,
                    count,
                    report.missing_share(field).unwrap_or(0.0) * 100.0
                )?;
            }
        }
    }

    if args.list_locations {
        let options = service.location_options(&source).await?;
        for option in &options.options {
            writeln!(out, "{:>4}  {}", option.value, option.label)?;
        }
        if let Some(reason) = options.reason {
            writeln!(out, "No locations: {}", reason)?;
        }
    }

    if let Some(path) = &args.output {
        let writer = BufWriter::new(File::create(path)?);
        let rows = write_windows_csv(data.table(), data.windows(), writer)?;
        writeln!(out, "Wrote {} rows to {}", rows, path.display())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use epicast::{
        data::{ingest::DataSource, record::RawRecord},
        util::test_util::setup_series,
    };

    struct Fixture(Vec<RawRecord>);

    impl RecordSource for Fixture {
        fn fetch(&self, _source: &DataSource) -> Result<Vec<RawRecord>, EpicastError> {
            Ok(self.0.clone())
        }
    }

    fn service(records: Vec<RawRecord>) -> PredictionService<Fixture> {
        let config = EpicastConfig {
            source: "owid.json".to_string(),
            encoder_length: 10,
            prediction_length: 3,
            static_reals: vec![],
            time_varying_known_reals: vec!["stringency_index".to_string()],
            targets: vec!["new_cases".to_string()],
            ..Default::default()
        };
        let names: Arc<dyn DisplayNameLookup> =
            Arc::new(IsoNameTable::from_pairs([("DEU", "Germany")]));
        PredictionService::new(config, Fixture(records), names)
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 1, 1).unwrap()
    }

    #[tokio::test]
    async fn test_too_short_history_prints_reason() {
        let (records, _guards) = setup_series("cli_short_history", start(), &[("DEU", 4)]);
        let args = Args::parse_from(["epicast", "--list-locations", "--report"]);
        let mut out = Vec::new();
        run(&args, &service(records), &mut out).await.unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("No locations: "));
        assert!(out.contains("at least 10 observations"));
    }

    #[tokio::test]
    async fn test_lists_locations_and_exports() {
        let (records, _guards) = setup_series("cli_lists_locations", start(), &[("DEU", 20)]);
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("windows.csv");
        let args = Args::parse_from([
            "epicast",
            "-l",
            "-o",
            csv_path.to_str().unwrap(),
        ]);
        let mut out = Vec::new();
        run(&args, &service(records), &mut out).await.unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("   0  Germany"));
        assert!(out.contains("Wrote 13 rows"));
        assert!(csv_path.exists());
    }
}
