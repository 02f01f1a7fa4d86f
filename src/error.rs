#[derive(Debug, thiserror::Error)]
pub enum EpicastError {
    #[error("Malformed input table: {0}")]
    DataFormat(String),
    #[error("{context} is missing required field `{field}`.")]
    Schema { context: String, field: String },
    #[error("No rows left after preparation: {0}")]
    EmptyDataset(String),
    #[error("No location has at least {required} observations (encoder length {encoder_length}, prediction length {prediction_length}); {locations} locations were excluded.")]
    EmptyWindowSet {
        encoder_length: usize,
        prediction_length: usize,
        required: usize,
        locations: usize,
    },
    #[error("Network Error: {0}")]
    Network(String),
    #[error("Failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },
    #[error("Unknown location identifier: {0}")]
    UnknownIdentifier(String),
    #[error("Selection index {index} is out of range for {len} locations.")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Configuration Error: {0}")]
    Config(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serde YAML Error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to parse date: {0}")]
    ParseDate(#[from] chrono::ParseError),
    #[error("Failed to convert date: {0}")]
    DateConversion(String),
    #[error("Prediction data build aborted: {0}")]
    BuildAborted(String),
}

impl EpicastError {
    pub fn parse(what: impl Into<String>, reason: impl ToString) -> Self {
        EpicastError::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// Valid input that filtered down to nothing. Callers report these as an
    /// empty result with the error message as the reason.
    pub fn is_empty_result(&self) -> bool {
        matches!(
            self,
            EpicastError::EmptyDataset(_) | EpicastError::EmptyWindowSet { .. }
        )
    }

    /// Collaborator failures the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, EpicastError::Network(_) | EpicastError::Parse { .. })
    }
}
