pub mod cache;
pub mod export;
pub mod ingest;
pub mod location_index;
pub mod prediction_data;
pub mod prepare;
pub mod record;
pub mod window;
