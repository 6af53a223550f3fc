use serde_json::Value as JsonValue;
use tix_core::{is_active_at, ClosureStatus, DropReason, IncidentPayload, SeverityFlag};

use crate::{
    json_f64, json_i64, json_str, json_text, json_time, lookup, record_array, SourceTransformer,
    TransformContext, TransformerKind,
};

const EVENT_TYPES: &[(i64, &str)] = &[
    (1, "Accident"),
    (3, "Dangerous Conditions"),
    (6, "Traffic Jam"),
    (7, "Lane Closure"),
    (8, "Road Closed"),
    (9, "Road Works"),
    (14, "Broken Down Vehicle"),
];

const CLOSURES: &[(i64, ClosureStatus)] = &[(7, ClosureStatus::Partial), (8, ClosureStatus::Closed)];

const MAGNITUDE_OF_DELAY: &[(i64, SeverityFlag)] = &[
    (0, SeverityFlag::Low),
    (1, SeverityFlag::Low),
    (2, SeverityFlag::Medium),
    (3, SeverityFlag::High),
    (4, SeverityFlag::Critical),
];

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// State code from a road number shaped like `PA-322`.
fn state_in_road_number(road: &str) -> Option<&str> {
    let bytes = road.as_bytes();
    for start in 0..bytes.len().saturating_sub(3) {
        if start > 0 && is_word_byte(bytes[start - 1]) {
            continue;
        }
        let code = &bytes[start..start + 2];
        if !code.iter().all(u8::is_ascii_uppercase) || bytes[start + 2] != b'-' {
            continue;
        }
        let digits = bytes[start + 3..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits == 0 {
            continue;
        }
        let end = start + 3 + digits;
        if end < bytes.len() && is_word_byte(bytes[end]) {
            continue;
        }
        return Some(&road[start..start + 2]);
    }
    None
}

fn state_from_road_numbers(props: &JsonValue) -> Option<String> {
    props
        .get("roadNumbers")?
        .as_array()?
        .iter()
        .filter_map(JsonValue::as_str)
        .find_map(state_in_road_number)
        .map(str::to_string)
}

/// TomTom incident details, GeoJSON features merged across bbox tiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct TomTomTransformer;

impl SourceTransformer for TomTomTransformer {
    fn kind(&self) -> TransformerKind {
        TransformerKind::TomTom
    }

    fn source_system(&self) -> &'static str {
        "TomTom_USA"
    }

    fn id_prefix(&self) -> &'static str {
        "TOMTOM"
    }

    fn records<'p>(&self, payload: &'p JsonValue) -> Vec<&'p JsonValue> {
        record_array(payload, &["features", "incidents"])
    }

    fn native_id(&self, record: &JsonValue) -> Option<String> {
        json_text(record, &["properties", "id"])
    }

    fn map_record(
        &self,
        record: &JsonValue,
        source_event_id: &str,
        ctx: &TransformContext<'_>,
    ) -> Result<IncidentPayload, DropReason> {
        let position =
            ctx.locate_geometry(self.source_system(), source_event_id, record.get("geometry"))?;
        let props = record.get("properties").unwrap_or(&JsonValue::Null);

        let icon_category = json_i64(props, &["iconCategory"]);
        let reported_time = json_time(props, &["startTime"]);
        let cleared_time = json_time(props, &["endTime"]);
        let route = props
            .get("roadNumbers")
            .and_then(|r| r.get(0))
            .and_then(JsonValue::as_str)
            .or_else(|| json_str(props, &["from"]))
            .unwrap_or("Unknown Route");
        let lanes_affected = match json_str(props, &["aci", "description"]) {
            Some(description) => description.to_string(),
            None => format!(
                "From {} to {}",
                json_str(props, &["from"]).unwrap_or("unknown"),
                json_str(props, &["to"]).unwrap_or("unknown")
            ),
        };

        Ok(IncidentPayload {
            uuid: ctx
                .identity
                .assign(self.id_prefix(), source_event_id)
                .to_string(),
            source_system: self.source_system().to_string(),
            source_event_id: source_event_id.to_string(),
            state: state_from_road_numbers(props),
            county: None,
            route: Some(route.to_string()),
            direction: None,
            milepost: None,
            latitude: position.lat,
            longitude: position.lon,
            reported_time,
            updated_time: reported_time.unwrap_or(ctx.now),
            cleared_time,
            is_active: is_active_at(cleared_time, ctx.now),
            event_type: Some(
                icon_category
                    .and_then(|c| lookup(EVENT_TYPES, c))
                    .unwrap_or("Unknown Event")
                    .to_string(),
            ),
            lanes_affected: Some(lanes_affected),
            closure_status: icon_category
                .and_then(|c| lookup(CLOSURES, c))
                .unwrap_or_default(),
            severity_flag: json_i64(props, &["magnitudeOfDelay"])
                .and_then(|m| lookup(MAGNITUDE_OF_DELAY, m))
                .unwrap_or_default(),
            // Seconds of delay, stored as whole minutes.
            severity_score: json_f64(props, &["delay"])
                .filter(|d| *d > 0.0)
                .map(|d| (d / 60.0).round() as i64),
            units_involved: None,
        })
    }
}
