//! Telemetry Models
//! Mission: Raw measurements and the point-mapping layer that gives them meaning

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Semantic names the statistics fold understands.
pub const SEMANTIC_CHARGE: &str = "charge_power_kw";
pub const SEMANTIC_DISCHARGE: &str = "discharge_power_kw";
pub const SEMANTIC_EARNINGS: &str = "earnings";
pub const SEMANTIC_CARBON: &str = "carbon_reduction";
/// Consumed by the anti-backflow strategy, not by the statistics fold.
pub const SEMANTIC_GRID_EXPORT: &str = "grid_export_kw";

pub const QUALITY_GOOD: &str = "good";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub tenant_id: String,
    pub station_id: String,
    pub device_id: String,
    pub point_key: String,
    pub ts: DateTime<Utc>,
    pub value_numeric: Option<f64>,
    pub value_text: Option<String>,
    pub quality: String,
}

/// Translates a raw point key into a semantic name and multiplicative scale.
/// A mapping with a `device_id` binds only that device; without one it
/// applies to any device publishing the point key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointMapping {
    pub id: String,
    pub station_id: String,
    pub device_id: Option<String>,
    pub point_key: String,
    pub semantic: String,
    pub unit: String,
    pub factor: f64,
}

impl PointMapping {
    pub fn applies_to(&self, device_id: &str, point_key: &str) -> bool {
        if self.point_key != point_key {
            return false;
        }
        match &self.device_id {
            Some(scoped) => scoped == device_id,
            None => true,
        }
    }
}

/// Pick the mapping for a measurement: device-scoped wins over un-scoped.
pub fn resolve_mapping<'a>(
    mappings: &'a [PointMapping],
    device_id: &str,
    point_key: &str,
) -> Option<&'a PointMapping> {
    mappings
        .iter()
        .filter(|m| m.applies_to(device_id, point_key))
        .max_by_key(|m| m.device_id.is_some())
}

/// One webhook point: a timestamp plus named values.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestPoint {
    pub ts: DateTime<Utc>,
    pub values: HashMap<String, f64>,
    pub quality: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestBatch {
    pub tenant_id: String,
    pub station_id: String,
    pub device_id: String,
    pub points: Vec<IngestPoint>,
}
