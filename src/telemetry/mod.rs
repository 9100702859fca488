//! Telemetry Pipeline
//! Mission: Webhook ingest, measurement persistence, hour-window closing

pub mod ingest;
pub mod models;
pub mod signature;
pub mod store;
pub mod window;

pub use ingest::IngestService;
pub use models::{IngestBatch, IngestPoint, MeasurementRow, PointMapping};
pub use store::{MeasurementStore, PointMappingStore};
pub use window::WindowCloser;
