use std::collections::BTreeMap;

use chrono::NaiveDate;
use derive_builder::Builder;
use serde::Serialize;

use crate::error::EpicastError;

/// One daily observation for one location, as delivered by a source.
///
/// Numeric fields are kept by name; a field may be absent from a record or
/// present with `None`, both of which count as missing.
#[derive(Debug, Clone, PartialEq, Builder, Serialize)]
#[builder(build_fn(error = "EpicastError"))]
pub struct RawRecord {
    #[builder(setter(into))]
    pub location: String,
    pub date: NaiveDate,
    #[builder(default, setter(into, strip_option))]
    pub continent: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub tests_units: Option<String>,
    #[builder(default, setter(custom))]
    pub values: BTreeMap<String, Option<f64>>,
}

impl RawRecordBuilder {
    pub fn value(&mut self, field: impl Into<String>, value: Option<f64>) -> &mut Self {
        self.values
            .get_or_insert_with(BTreeMap::new)
            .insert(field.into(), value);
        self
    }
}

impl From<derive_builder::UninitializedFieldError> for EpicastError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        EpicastError::DataFormat(format!("record is missing `{}`", e.field_name()))
    }
}

impl RawRecord {
    /// Returns the finite value of `field`, or `None` if it is missing.
    pub fn value(&self, field: &str) -> Option<f64> {
        self.values
            .get(field)
            .copied()
            .flatten()
            .filter(|v| v.is_finite())
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }
}
