use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EpicastError;

use super::window::PredictionWindows;

/// Resolves a location identifier to the name shown to users.
pub trait DisplayNameLookup: Send + Sync {
    fn resolve(&self, identifier: &str) -> Result<String, EpicastError>;
}

#[derive(Debug, Deserialize)]
struct IsoNameRecord {
    #[serde(rename = "ISO3")]
    iso3: String,
    name: String,
}

/// ISO3 code to country name table, read from a CSV with `ISO3` and `name` columns.
#[derive(Debug, Clone, Default)]
pub struct IsoNameTable {
    names: HashMap<String, String>,
}

impl IsoNameTable {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, EpicastError> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let mut names = HashMap::new();
        for record in reader.deserialize() {
            let record: IsoNameRecord = record?;
            names.insert(record.iso3, record.name);
        }
        info!("Loaded {} display names from {}", names.len(), path.as_ref().display());
        Ok(Self { names })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            names: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl DisplayNameLookup for IsoNameTable {
    fn resolve(&self, identifier: &str) -> Result<String, EpicastError> {
        self.names
            .get(identifier)
            .cloned()
            .ok_or_else(|| EpicastError::UnknownIdentifier(identifier.to_string()))
    }
}

/// Selector entry: a display label and the integer value the UI sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationOption {
    pub label: String,
    pub value: usize,
}

/// Bijection between selector indices `0..len` and retained location identifiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationIndexMap {
    ids: Vec<String>,
    positions: HashMap<String, usize>,
}

impl LocationIndexMap {
    /// Assigns indices in first-appearance order; repeated identifiers keep their first index.
    pub fn build<'a, I>(locations: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut map = Self::default();
        for location in locations {
            if !map.positions.contains_key(location) {
                map.positions.insert(location.to_string(), map.ids.len());
                map.ids.push(location.to_string());
            }
        }
        debug!("Built location index with {} entries", map.ids.len());
        map
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id_to_index(&self, identifier: &str) -> Result<usize, EpicastError> {
        self.positions
            .get(identifier)
            .copied()
            .ok_or_else(|| EpicastError::UnknownIdentifier(identifier.to_string()))
    }

    pub fn index_to_id(&self, index: usize) -> Result<&str, EpicastError> {
        self.ids
            .get(index)
            .map(String::as_str)
            .ok_or(EpicastError::IndexOutOfRange {
                index,
                len: self.ids.len(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.ids.iter().map(String::as_str).enumerate()
    }

    /// Label for the location at `index`. Aggregates (identifiers starting with
    /// `aggregate_prefix`) are shown verbatim, everything else goes through `lookup`.
    pub fn label(
        &self,
        index: usize,
        lookup: &dyn DisplayNameLookup,
        aggregate_prefix: &str,
    ) -> Result<String, EpicastError> {
        display_label(self.index_to_id(index)?, lookup, aggregate_prefix)
    }

    pub fn options(
        &self,
        lookup: &dyn DisplayNameLookup,
        aggregate_prefix: &str,
    ) -> Result<Vec<LocationOption>, EpicastError> {
        self.iter()
            .map(|(value, id)| {
                Ok(LocationOption {
                    label: display_label(id, lookup, aggregate_prefix)?,
                    value,
                })
            })
            .collect()
    }
}

/// Index over exactly the locations that survived windowing.
pub fn build_index(windows: &PredictionWindows) -> LocationIndexMap {
    LocationIndexMap::build(windows.locations())
}

fn display_label(
    identifier: &str,
    lookup: &dyn DisplayNameLookup,
    aggregate_prefix: &str,
) -> Result<String, EpicastError> {
    if identifier.starts_with(aggregate_prefix) {
        Ok(identifier.to_string())
    } else {
        lookup.resolve(identifier)
    }
}
