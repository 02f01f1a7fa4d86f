use std::{
    fs::File,
    io::{BufReader, Write as _},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_yaml::from_reader;
use tracing::{debug, info, instrument};

use crate::{
    data::{ingest::DataSource, prepare::FeatureSpec, window::WindowSpec},
    error::EpicastError,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct EpicastConfig {
    pub source: String,
    pub encoder_length: usize,
    pub prediction_length: usize,
    #[serde(default)]
    pub static_reals: Vec<String>,
    #[serde(default)]
    pub time_varying_known_reals: Vec<String>,
    pub targets: Vec<String>,
    #[serde(default = "default_impute_target")]
    pub impute_target: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_aggregate_prefix")]
    pub aggregate_prefix: String,
    #[serde(default = "default_iso_names")]
    pub iso_names: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

fn default_impute_target() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    600
}

fn default_aggregate_prefix() -> String {
    "OWID".to_string()
}

fn default_iso_names() -> PathBuf {
    PathBuf::from("iso3.csv")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_http_timeout() -> u64 {
    60
}

const DEFAULT_DATA: &str = r#"
source: "https://covid.ourworldindata.org/data/owid-covid-data.json"
encoder-length: 180
prediction-length: 7
static-reals:
  - "population"
  - "population_density"
  - "median_age"
  - "gdp_per_capita"
  - "hospital_beds_per_thousand"
time-varying-known-reals:
  - "new_tests"
  - "people_vaccinated_per_hundred"
  - "stringency_index"
targets:
  - "new_cases"
impute-target: true
cache-ttl-seconds: 600
aggregate-prefix: "OWID"
iso-names: "iso3.csv"
data-dir: "data"
http-timeout-seconds: 60
"#;

impl Default for EpicastConfig {
    fn default() -> Self {
        Self {
            source: "https://covid.ourworldindata.org/data/owid-covid-data.json".to_string(),
            encoder_length: 180,
            prediction_length: 7,
            static_reals: vec![
                "population".to_string(),
                "population_density".to_string(),
                "median_age".to_string(),
                "gdp_per_capita".to_string(),
                "hospital_beds_per_thousand".to_string(),
            ],
            time_varying_known_reals: vec![
                "new_tests".to_string(),
                "people_vaccinated_per_hundred".to_string(),
                "stringency_index".to_string(),
            ],
            targets: vec!["new_cases".to_string()],
            impute_target: default_impute_target(),
            cache_ttl_seconds: default_cache_ttl(),
            aggregate_prefix: default_aggregate_prefix(),
            iso_names: default_iso_names(),
            data_dir: default_data_dir(),
            http_timeout_seconds: default_http_timeout(),
        }
    }
}

impl EpicastConfig {
    /// Reads the configuration from a YAML file.
    ///
    /// If the file does not exist, it creates a default configuration file.
    ///
    /// # Arguments
    ///
    /// * `filename` - Optional path to the configuration file.
    ///
    /// # Returns
    ///
    /// A `Result` containing the validated `EpicastConfig` on success.
    #[instrument(level = "info", skip(filename))]
    pub fn read_config<P: AsRef<Path>>(filename: Option<P>) -> Result<Self, EpicastError> {
        let path = filename
            .map(|p| p.as_ref().to_path_buf())
            .unwrap_or_else(|| Path::new("config.yml").to_path_buf());

        info!(path = %path.display(), "Reading configuration");

        if !path.exists() {
            info!(
                "Config file does not exist. Creating default config at {}",
                path.display()
            );
            let mut file = File::create(&path)?;
            file.write_all(DEFAULT_DATA.as_bytes())?;
            debug!("Default configuration file created");
            return Ok(EpicastConfig::default());
        }

        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let config: Self = from_reader(reader)?;
        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EpicastError> {
        if self.encoder_length == 0 {
            return Err(EpicastError::Config(
                "encoder-length must be positive".to_string(),
            ));
        }
        if self.prediction_length == 0 {
            return Err(EpicastError::Config(
                "prediction-length must be positive".to_string(),
            ));
        }
        if self.cache_ttl_seconds == 0 {
            return Err(EpicastError::Config(
                "cache-ttl-seconds must be positive".to_string(),
            ));
        }
        if self.http_timeout_seconds == 0 {
            return Err(EpicastError::Config(
                "http-timeout-seconds must be positive".to_string(),
            ));
        }
        if self.targets.is_empty() {
            return Err(EpicastError::Config(
                "at least one target field is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn data_source(&self) -> DataSource {
        DataSource::parse(&self.source)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn feature_spec(&self) -> FeatureSpec {
        FeatureSpec {
            static_reals: self.static_reals.clone(),
            time_varying_known_reals: self.time_varying_known_reals.clone(),
            targets: self.targets.clone(),
            impute_target: self.impute_target,
        }
    }

    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec {
            encoder_length: self.encoder_length,
            prediction_length: self.prediction_length,
            targets: self.targets.clone(),
        }
    }
}
