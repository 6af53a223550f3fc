//! Canonical incident model, geo validation and identity derivation for TIX.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub mod geo;
pub mod identity;

pub use geo::{
    BoundingBox, CoordinateValidator, Geometry, GeometryExtractor, PointMethod, Position,
    RepresentativePoint,
};
pub use identity::{IdentityAssigner, DEFAULT_NAMESPACE};

pub const CRATE_NAME: &str = "tix-core";

/// Store wire format for every timestamp column.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClosureStatus {
    Open,
    Closed,
    Partial,
    #[default]
    Unknown,
}

impl ClosureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Partial => "PARTIAL",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Self::Open,
            "CLOSED" => Self::Closed,
            "PARTIAL" => Self::Partial,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityFlag {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "MEDIUM" => Self::Medium,
            "HIGH" => Self::High,
            "CRITICAL" => Self::Critical,
            _ => Self::Low,
        }
    }
}

/// Canonical incident row as sent to the store.
///
/// Serializes to the flat upsert contract: `is_active` as 0/1 and all
/// timestamps as `YYYY-MM-DD HH:MM:SS` in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentPayload {
    pub uuid: String,
    pub source_system: String,
    pub source_event_id: String,
    pub state: Option<String>,
    pub county: Option<String>,
    pub route: Option<String>,
    pub direction: Option<String>,
    pub milepost: Option<f64>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(with = "wire_time::option")]
    pub reported_time: Option<DateTime<Utc>>,
    #[serde(with = "wire_time")]
    pub updated_time: DateTime<Utc>,
    #[serde(with = "wire_time::option")]
    pub cleared_time: Option<DateTime<Utc>>,
    #[serde(with = "active_flag")]
    pub is_active: bool,
    pub event_type: Option<String>,
    pub lanes_affected: Option<String>,
    pub closure_status: ClosureStatus,
    pub severity_flag: SeverityFlag,
    pub severity_score: Option<i64>,
    pub units_involved: Option<i64>,
}

impl IncidentPayload {
    /// Applies an upsert onto an existing row: only the fields a later sync
    /// may legitimately change are taken from `incoming`.
    pub fn merge_mutable(&mut self, incoming: &IncidentPayload) {
        self.updated_time = incoming.updated_time;
        self.cleared_time = incoming.cleared_time;
        self.is_active = incoming.is_active;
        self.event_type = incoming.event_type.clone();
        self.lanes_affected = incoming.lanes_affected.clone();
        self.closure_status = incoming.closure_status;
        self.severity_flag = incoming.severity_flag;
        self.severity_score = incoming.severity_score;
        self.units_involved = incoming.units_involved;
    }
}

/// An incident is active unless it carries a clearance time at or before `now`.
pub fn is_active_at(cleared_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match cleared_time {
        Some(cleared) => cleared > now,
        None => true,
    }
}

/// Outcome surfaced to whoever triggered a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
}

impl SyncResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DropReason {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing source event id")]
    MissingId,
    #[error("no usable coordinates")]
    MissingCoordinates,
    #[error("invalid coordinates [{lon}, {lat}]")]
    InvalidCoordinates { lat: f64, lon: f64 },
}

/// A raw record excluded during transformation. Never fatal to a sync.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationDrop {
    pub source: String,
    pub source_event_id: Option<String>,
    pub reason: DropReason,
}

/// Injected collaborator that receives the noise produced by transforms.
pub trait IngestObserver: Send + Sync {
    fn record_dropped(&self, drop: &ValidationDrop);

    fn record_point(&self, _source: &str, _source_event_id: &str, _point: &RepresentativePoint) {}

    fn record_transformed(&self, _source: &str, _kept: usize, _dropped: usize) {}
}

/// Default observer: forwards everything to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl IngestObserver for TracingObserver {
    fn record_dropped(&self, drop: &ValidationDrop) {
        debug!(
            source = %drop.source,
            source_event_id = drop.source_event_id.as_deref().unwrap_or("<none>"),
            reason = %drop.reason,
            "skipping record"
        );
    }

    fn record_point(&self, source: &str, source_event_id: &str, point: &RepresentativePoint) {
        if point.method != PointMethod::Point {
            debug!(
                source,
                source_event_id,
                method = ?point.method,
                lon = point.position.lon,
                lat = point.position.lat,
                "derived representative point"
            );
        }
    }

    fn record_transformed(&self, source: &str, kept: usize, dropped: usize) {
        info!(source, kept, dropped, "transformed source payload");
    }
}

pub fn format_wire_time(value: &DateTime<Utc>) -> String {
    value.format(WIRE_TIME_FORMAT).to_string()
}

pub fn parse_wire_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), WIRE_TIME_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub mod wire_time {
    use chrono::{DateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_wire_time(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_wire_time(&raw).ok_or_else(|| D::Error::custom(format!("bad wire timestamp {raw:?}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&super::super::format_wire_time(v)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::super::parse_wire_time(&raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("bad wire timestamp {raw:?}"))),
                None => Ok(None),
            }
        }
    }
}

mod active_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(updated: DateTime<Utc>) -> IncidentPayload {
        IncidentPayload {
            uuid: "5a7b0e71-f659-539a-ade6-4d75e3ec8d2a".into(),
            source_system: "OHGO_Official".into(),
            source_event_id: "1001".into(),
            state: Some("OH".into()),
            county: None,
            route: Some("I-71".into()),
            direction: None,
            milepost: Some(12.5),
            latitude: 39.96,
            longitude: -82.99,
            reported_time: None,
            updated_time: updated,
            cleared_time: None,
            is_active: true,
            event_type: Some("Crash".into()),
            lanes_affected: None,
            closure_status: ClosureStatus::Partial,
            severity_flag: SeverityFlag::High,
            severity_score: None,
            units_involved: None,
        }
    }

    #[test]
    fn payload_serializes_to_flat_store_contract() {
        let updated = Utc.with_ymd_and_hms(2026, 3, 1, 14, 5, 9).single().unwrap();
        let value = serde_json::to_value(sample(updated)).unwrap();
        assert_eq!(value["updated_time"], "2026-03-01 14:05:09");
        assert_eq!(value["is_active"], 1);
        assert_eq!(value["closure_status"], "PARTIAL");
        assert_eq!(value["severity_flag"], "HIGH");
        assert!(value["cleared_time"].is_null());

        let back: IncidentPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.updated_time, updated);
        assert!(back.is_active);
    }

    #[test]
    fn cleared_in_past_means_inactive() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        assert!(is_active_at(None, now));
        assert!(is_active_at(Some(now + Duration::hours(2)), now));
        assert!(!is_active_at(Some(now - Duration::minutes(1)), now));
    }

    #[test]
    fn merge_keeps_identity_and_location() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let mut stored = sample(t0);
        let mut incoming = sample(t0 + Duration::minutes(30));
        incoming.route = Some("I-270".into());
        incoming.latitude = 40.5;
        incoming.is_active = false;
        incoming.severity_flag = SeverityFlag::Low;
        stored.merge_mutable(&incoming);
        assert_eq!(stored.updated_time, t0 + Duration::minutes(30));
        assert!(!stored.is_active);
        assert_eq!(stored.severity_flag, SeverityFlag::Low);
        assert_eq!(stored.route.as_deref(), Some("I-71"));
        assert_eq!(stored.latitude, 39.96);
    }

    #[test]
    fn enum_wire_values_default_when_unrecognised() {
        assert_eq!(ClosureStatus::from_wire("closed"), ClosureStatus::Closed);
        assert_eq!(ClosureStatus::from_wire("detour"), ClosureStatus::Unknown);
        assert_eq!(SeverityFlag::from_wire("Critical"), SeverityFlag::Critical);
        assert_eq!(SeverityFlag::from_wire(""), SeverityFlag::Low);
    }

    #[test]
    fn wire_time_rejects_other_layouts() {
        assert!(parse_wire_time("2026-03-01 14:05:09").is_some());
        assert!(parse_wire_time("2026-03-01T14:05:09Z").is_none());
    }
}
