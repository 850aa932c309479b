//! Canonical domain model for the green-space sensor service.
//!
//! One family of types serves every layer: the wire codec (`codec.rs`) and the
//! database codec (`store/postgres.rs`) both translate to and from these
//! structs directly.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

// ---

/// Connectivity state asserted by callers. Never inferred from traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SensorStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Online => "online",
            SensorStatus::Offline => "offline",
            SensorStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(SensorStatus::Online),
            "offline" => Ok(SensorStatus::Offline),
            "unknown" => Ok(SensorStatus::Unknown),
            other => Err(Error::BadRequest(format!("invalid sensor status '{other}'"))),
        }
    }
}

/// A registered field device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sensor {
    pub id: String,
    pub status: SensorStatus,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated input for creating a sensor row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSensor {
    pub id: String,
    pub status: SensorStatus,
    pub latitude: f64,
    pub longitude: f64,
}

/// Field-level changes applied to an existing sensor row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorChanges {
    pub status: Option<SensorStatus>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl SensorChanges {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.latitude.is_none() && self.longitude.is_none()
    }
}

/// One watermark soil-moisture probe sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Watermark {
    /// Ohms.
    pub resistance: i32,
    /// Soil suction.
    pub centibar: i32,
    /// Centimetres below ground; never negative.
    pub depth: i32,
}

/// Opaque uplink metadata carried alongside a reading.
///
/// Stored as-is; only a handful of accessors look inside it. Keys may appear at
/// the top level (flat form) or under `uplink_message` (network-server form).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UplinkMetadata(pub Map<String, Value>);

impl UplinkMetadata {
    fn lookup(&self, key: &str) -> Option<&Value> {
        self.0.get(key).or_else(|| {
            self.0
                .get("uplink_message")
                .and_then(|m| m.as_object())
                .and_then(|m| m.get(key))
        })
    }

    /// Device frame counter; zero when the uplink does not carry one.
    pub fn frame_counter(&self) -> i64 {
        self.lookup("f_cnt").and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn dev_eui(&self) -> Option<&str> {
        self.0.get("dev_eui").and_then(Value::as_str).or_else(|| {
            self.0
                .get("end_device_ids")
                .and_then(|ids| ids.get("dev_eui"))
                .and_then(Value::as_str)
        })
    }

    pub fn confirmed(&self) -> bool {
        self.lookup("confirmed").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Best RSSI across all gateways that heard the uplink.
    pub fn best_rssi(&self) -> Option<i64> {
        self.lookup("rx_metadata")
            .and_then(Value::as_array)?
            .iter()
            .filter_map(|gw| gw.get("rssi").and_then(Value::as_i64))
            .max()
    }
}

/// One telemetry sample in canonical (flat) form.
///
/// `id` is zero until the store assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorReading {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub sensor_id: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub battery: f64,
    #[serde(default)]
    pub humidity: i32,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub watermarks: Vec<Watermark>,
    #[serde(default)]
    pub raw: UplinkMetadata,
}

impl SensorReading {
    pub fn new(sensor_id: impl Into<String>) -> Self {
        // ---
        SensorReading {
            id: 0,
            sensor_id: sensor_id.into(),
            received_at: None,
            battery: 0.0,
            humidity: 0,
            temperature: 0.0,
            watermarks: Vec::new(),
            raw: UplinkMetadata::default(),
        }
    }

    /// Timestamp used for ordering and deduplication.
    pub fn effective_at(&self, stored_at: DateTime<Utc>) -> DateTime<Utc> {
        truncate_micros(self.received_at.unwrap_or(stored_at))
    }
}

/// Drop sub-microsecond digits; `TIMESTAMPTZ` keeps no more.
pub fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::microseconds(1))
        .unwrap_or(at)
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(SensorReading),
    /// The dedup key already existed; carries the pre-existing row.
    Duplicate(SensorReading),
}

impl InsertOutcome {
    pub fn reading(&self) -> &SensorReading {
        match self {
            InsertOutcome::Created(r) | InsertOutcome::Duplicate(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::Duplicate(_))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TreeLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub additional_info: String,
}

/// A managed urban tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub id: i64,
    pub species: String,
    pub tree_number: String,
    pub age: i32,
    pub location: TreeLocation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewTree {
    pub species: String,
    pub tree_number: String,
    #[serde(default)]
    pub age: i32,
    pub location: TreeLocation,
}

/// Coarse humidity-derived health label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Good,
    Moderate,
    Bad,
    Unknown,
}

impl Health {
    /// `good` at 60 and above, `moderate` from 40, `bad` below.
    pub fn from_humidity(humidity: i32) -> Self {
        match humidity {
            h if h >= 60 => Health::Good,
            h if h >= 40 => Health::Moderate,
            _ => Health::Bad,
        }
    }
}

/// A sensor attached to a tree together with its recent telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorData {
    pub sensor_id: String,
    pub latest: Option<SensorReading>,
    pub readings: Vec<SensorReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeSensorData {
    pub tree: Tree,
    pub sensors: Vec<SensorData>,
}

/// Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorPrediction {
    pub sensor_id: String,
    pub tree_id: i64,
    pub health: Health,
    /// Humidity the label was derived from; absent when there is no reading.
    pub humidity: Option<i32>,
    pub readings: Vec<SensorReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeSensorPrediction {
    pub tree: Tree,
    pub sensors: Vec<SensorPrediction>,
}

// ---

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 200;

/// Offset pagination request, already clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    /// Missing values become `page=1, limit=50`; limit is clamped to `[1, 200]`.
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Page {
            page: page.unwrap_or(1).max(1),
            limit: limit
                .unwrap_or(DEFAULT_PAGE_LIMIT)
                .clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }

    pub fn pagination(&self, total_records: u64) -> Pagination {
        // ---
        let total_pages = total_records.div_ceil(u64::from(self.limit)) as u32;
        Pagination {
            total_records,
            current_page: self.page,
            total_pages,
            next_page: (self.page < total_pages).then(|| self.page + 1),
            prev_page: (self.page > 1).then(|| self.page - 1),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total_records: u64,
    pub current_page: u32,
    pub total_pages: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_page: Option<u32>,
}

/// One page of results plus its pagination block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

/// Inclusive receive-time window for reading queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }
}
