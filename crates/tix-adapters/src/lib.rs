//! Source transformer contracts + per-feed transformer implementations.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tix_core::{
    parse_wire_time, CoordinateValidator, DropReason, GeometryExtractor, IdentityAssigner,
    IncidentPayload, IngestObserver, Position, ValidationDrop,
};

mod drivetexas;
mod ohgo;
mod tomtom;

pub use drivetexas::{DriveTexasItravelTransformer, DriveTexasTransformer};
pub use ohgo::{OhgoConstructionTransformer, OhgoTransformer};
pub use tomtom::TomTomTransformer;

pub const CRATE_NAME: &str = "tix-adapters";

/// The closed set of feed shapes the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformerKind {
    Ohgo,
    OhgoConstruction,
    DriveTexas,
    DriveTexasItravel,
    TomTom,
}

impl TransformerKind {
    pub fn transformer(self) -> Box<dyn SourceTransformer> {
        match self {
            Self::Ohgo => Box::new(OhgoTransformer),
            Self::OhgoConstruction => Box::new(OhgoConstructionTransformer),
            Self::DriveTexas => Box::new(DriveTexasTransformer),
            Self::DriveTexasItravel => Box::new(DriveTexasItravelTransformer),
            Self::TomTom => Box::new(TomTomTransformer),
        }
    }
}

/// Collaborators and clock shared by every record of one transform call.
pub struct TransformContext<'a> {
    pub extractor: &'a GeometryExtractor,
    pub identity: &'a IdentityAssigner,
    pub observer: &'a dyn IngestObserver,
    pub now: DateTime<Utc>,
}

impl<'a> TransformContext<'a> {
    pub fn validator(&self) -> &CoordinateValidator {
        self.extractor.validator()
    }

    /// Representative point of a GeoJSON geometry, reported to the observer.
    pub fn locate_geometry(
        &self,
        source: &str,
        source_event_id: &str,
        geometry: Option<&JsonValue>,
    ) -> Result<Position, DropReason> {
        let point = geometry
            .and_then(|g| self.extractor.extract_point_json(g))
            .ok_or(DropReason::MissingCoordinates)?;
        self.observer.record_point(source, source_event_id, &point);
        Ok(point.position)
    }

    pub fn validate_pair(&self, lat: Option<f64>, lon: Option<f64>) -> Result<Position, DropReason> {
        let (Some(lat), Some(lon)) = (lat, lon) else {
            return Err(DropReason::MissingCoordinates);
        };
        if self.validator().is_valid(lat, lon) {
            Ok(Position::new(lon, lat))
        } else {
            Err(DropReason::InvalidCoordinates { lat, lon })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    pub incidents: Vec<IncidentPayload>,
    pub input_records: usize,
    pub dropped: usize,
}

/// One feed shape mapped onto the canonical incident.
///
/// Implementors describe how to find records, ids and fields; `transform`
/// runs the shared steps and never fails. Output order is unspecified.
pub trait SourceTransformer: Send + Sync {
    fn kind(&self) -> TransformerKind;

    /// Value stored in `source_system`.
    fn source_system(&self) -> &'static str;

    /// Prefix of the identity name, `"{prefix}-{id}"`.
    fn id_prefix(&self) -> &'static str;

    fn records<'p>(&self, payload: &'p JsonValue) -> Vec<&'p JsonValue>;

    fn native_id(&self, record: &JsonValue) -> Option<String>;

    fn map_record(
        &self,
        record: &JsonValue,
        source_event_id: &str,
        ctx: &TransformContext<'_>,
    ) -> Result<IncidentPayload, DropReason>;

    fn transform(&self, payload: &JsonValue, ctx: &TransformContext<'_>) -> TransformOutput {
        let records = self.records(payload);
        let input_records = records.len();
        let (unique, missing_ids) = dedup_by_native_id(records, |r| self.native_id(r));

        let mut dropped = 0usize;
        for record in missing_ids {
            let reason = if record.is_object() {
                DropReason::MissingId
            } else {
                DropReason::NotAnObject
            };
            ctx.observer.record_dropped(&ValidationDrop {
                source: self.source_system().to_string(),
                source_event_id: None,
                reason,
            });
            dropped += 1;
        }

        let mut incidents = Vec::with_capacity(unique.len());
        for (source_event_id, record) in unique {
            match self.map_record(record, &source_event_id, ctx) {
                Ok(incident) => incidents.push(incident),
                Err(reason) => {
                    ctx.observer.record_dropped(&ValidationDrop {
                        source: self.source_system().to_string(),
                        source_event_id: Some(source_event_id),
                        reason,
                    });
                    dropped += 1;
                }
            }
        }

        ctx.observer
            .record_transformed(self.source_system(), incidents.len(), dropped);
        TransformOutput {
            incidents,
            input_records,
            dropped,
        }
    }
}

/// Collapses records sharing a native id; the last occurrence wins but keeps
/// the slot of the first. Records without an id are returned separately.
pub fn dedup_by_native_id<'p, F>(
    records: Vec<&'p JsonValue>,
    native_id: F,
) -> (Vec<(String, &'p JsonValue)>, Vec<&'p JsonValue>)
where
    F: Fn(&JsonValue) -> Option<String>,
{
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<(String, &JsonValue)> = Vec::new();
    let mut missing = Vec::new();
    for record in records {
        let Some(id) = native_id(record) else {
            missing.push(record);
            continue;
        };
        match slots.get(&id) {
            Some(&slot) => unique[slot].1 = record,
            None => {
                slots.insert(id.clone(), unique.len());
                unique.push((id, record));
            }
        }
    }
    (unique, missing)
}

/// Merges several payloads of one feed (e.g. geo tiles) into a single bare
/// array of records, deduplicated by native id. Records without an id are
/// kept at the end so `transform` still reports them as drops.
pub fn merge_payloads(transformer: &dyn SourceTransformer, payloads: &[JsonValue]) -> JsonValue {
    let records = payloads
        .iter()
        .flat_map(|p| transformer.records(p))
        .collect::<Vec<_>>();
    let (unique, missing) = dedup_by_native_id(records, |r| transformer.native_id(r));
    JsonValue::Array(
        unique
            .into_iter()
            .map(|(_, r)| r)
            .chain(missing)
            .cloned()
            .collect(),
    )
}

/// Records of a bare array, or of the first array found under one of `keys`.
pub fn record_array<'p>(payload: &'p JsonValue, keys: &[&str]) -> Vec<&'p JsonValue> {
    if let Some(items) = payload.as_array() {
        return items.iter().collect();
    }
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(JsonValue::as_array))
        .map(|items| items.iter().collect())
        .unwrap_or_default()
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

/// Non-empty trimmed string at `path`.
pub fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// String or number at `path`, rendered as text. Feeds disagree on id types.
pub fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Number at `path`; numeric strings are accepted.
pub fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let number = match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

pub fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    json_f64(value, path).map(|v| v as i64)
}

/// Boolean at `path`; `"true"`/`"false"` strings and 0/1 are accepted.
pub fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    match json_at(value, path)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        JsonValue::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}

/// Timestamp at `path`: RFC 3339, naive ISO or wire-format text (read as
/// UTC), or epoch milliseconds as a number or digit string.
pub fn json_time(value: &JsonValue, path: &[&str]) -> Option<DateTime<Utc>> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_i64().and_then(from_epoch_millis),
        JsonValue::String(s) => parse_timestamp(s),
        _ => None,
    }
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse().ok().and_then(from_epoch_millis);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    parse_wire_time(text)
}

fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

/// Exact lookup in an immutable vocabulary table.
pub fn lookup<K: PartialEq + Copy, V: Copy>(table: &[(K, V)], key: K) -> Option<V> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}
