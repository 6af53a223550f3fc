use serde_json::Value as JsonValue;
use tix_core::{is_active_at, ClosureStatus, DropReason, IncidentPayload, SeverityFlag};

use crate::{
    json_bool, json_f64, json_i64, json_str, json_text, json_time, lookup, record_array,
    SourceTransformer, TransformContext, TransformerKind,
};

// Matched against the lowercased description, first hit wins.
const CLOSURE_KEYWORDS: &[(&str, ClosureStatus)] = &[
    ("closed", ClosureStatus::Closed),
    ("lane blocked", ClosureStatus::Partial),
    ("shoulder blocked", ClosureStatus::Partial),
];

fn closure_from_description(description: Option<&str>) -> ClosureStatus {
    let description = description.unwrap_or_default().to_lowercase();
    CLOSURE_KEYWORDS
        .iter()
        .find(|(keyword, _)| description.contains(keyword))
        .map(|(_, closure)| *closure)
        .unwrap_or_default()
}

/// DriveTexas GeoJSON FeatureCollection.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriveTexasTransformer;

impl SourceTransformer for DriveTexasTransformer {
    fn kind(&self) -> TransformerKind {
        TransformerKind::DriveTexas
    }

    fn source_system(&self) -> &'static str {
        "DriveTexas_Official"
    }

    fn id_prefix(&self) -> &'static str {
        "TX"
    }

    fn records<'p>(&self, payload: &'p JsonValue) -> Vec<&'p JsonValue> {
        record_array(payload, &["features"])
    }

    fn native_id(&self, record: &JsonValue) -> Option<String> {
        json_text(record, &["properties", "GLOBALID"])
            .or_else(|| json_text(record, &["properties", "Identifier"]))
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

        let reported_time = json_time(props, &["start_time"]);
        let cleared_time = json_time(props, &["end_time"]);
        let updated_time = json_time(props, &["create_time"])
            .or(reported_time)
            .unwrap_or(ctx.now);
        let description = json_str(props, &["description"]);
        let severity_flag = if json_bool(props, &["delay_flag"]).unwrap_or(false) {
            SeverityFlag::Medium
        } else {
            SeverityFlag::Low
        };

        Ok(IncidentPayload {
            uuid: ctx
                .identity
                .assign(self.id_prefix(), source_event_id)
                .to_string(),
            source_system: self.source_system().to_string(),
            source_event_id: source_event_id.to_string(),
            state: Some("TX".to_string()),
            county: json_text(props, &["county_num"]),
            route: Some(
                json_str(props, &["route_name"])
                    .unwrap_or("Unknown Route")
                    .to_string(),
            ),
            direction: json_str(props, &["travel_direction"]).map(str::to_string),
            milepost: json_f64(props, &["from_ref_marker"]),
            latitude: position.lat,
            longitude: position.lon,
            reported_time,
            updated_time,
            cleared_time,
            is_active: is_active_at(cleared_time, ctx.now),
            event_type: Some(
                json_str(props, &["condition"])
                    .unwrap_or("Unknown")
                    .to_string(),
            ),
            lanes_affected: description.map(str::to_string),
            closure_status: closure_from_description(description),
            severity_flag,
            severity_score: None,
            units_involved: None,
        })
    }
}

const ITRAVEL_SEVERITY: &[(i64, SeverityFlag)] = &[
    (1, SeverityFlag::Low),
    (2, SeverityFlag::Medium),
    (3, SeverityFlag::High),
    (4, SeverityFlag::Critical),
];

const ITRAVEL_SEVERITY_SCORE: &[(i64, i64)] = &[(1, 25), (2, 50), (3, 75), (4, 95)];

/// Legacy DriveTexas iTravel feed: flat records with `Latitude`/`Longitude`,
/// an `IsActive` flag and a numeric 1-4 `Severity`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriveTexasItravelTransformer;

impl SourceTransformer for DriveTexasItravelTransformer {
    fn kind(&self) -> TransformerKind {
        TransformerKind::DriveTexasItravel
    }

    fn source_system(&self) -> &'static str {
        "DriveTexas_iTravel"
    }

    fn id_prefix(&self) -> &'static str {
        "TX-ITRAVEL"
    }

    fn records<'p>(&self, payload: &'p JsonValue) -> Vec<&'p JsonValue> {
        record_array(payload, &["results", "Incidents"])
    }

    fn native_id(&self, record: &JsonValue) -> Option<String> {
        json_text(record, &["Id"])
    }

    fn map_record(
        &self,
        record: &JsonValue,
        source_event_id: &str,
        ctx: &TransformContext<'_>,
    ) -> Result<IncidentPayload, DropReason> {
        let position = ctx.validate_pair(
            json_f64(record, &["Latitude"]),
            json_f64(record, &["Longitude"]),
        )?;

        let flagged_active = json_bool(record, &["IsActive"]).unwrap_or(true);
        let reported_time = json_time(record, &["ReportedTime"]);
        let updated_time = json_time(record, &["LastUpdated"]).unwrap_or(ctx.now);
        let cleared_time = (!flagged_active).then_some(updated_time);

        // Out-of-range grades read the same as a missing one.
        let severity = json_i64(record, &["Severity"]);
        let severity_flag = severity
            .and_then(|grade| lookup(ITRAVEL_SEVERITY, grade))
            .unwrap_or_default();
        let severity_score = severity
            .and_then(|grade| lookup(ITRAVEL_SEVERITY_SCORE, grade))
            .unwrap_or(25);

        Ok(IncidentPayload {
            uuid: ctx
                .identity
                .assign(self.id_prefix(), source_event_id)
                .to_string(),
            source_system: self.source_system().to_string(),
            source_event_id: source_event_id.to_string(),
            state: Some("TX".to_string()),
            county: json_str(record, &["County"]).map(str::to_string),
            route: json_str(record, &["RoadwayName"]).map(str::to_string),
            direction: json_str(record, &["Direction"]).map(str::to_string),
            milepost: None,
            latitude: position.lat,
            longitude: position.lon,
            reported_time,
            updated_time,
            cleared_time,
            is_active: flagged_active,
            event_type: Some(
                json_str(record, &["TypeOfIncident"])
                    .unwrap_or("Unknown")
                    .to_string(),
            ),
            lanes_affected: json_str(record, &["LanesAffected"]).map(str::to_string),
            closure_status: ClosureStatus::Unknown,
            severity_flag,
            severity_score: Some(severity_score),
            units_involved: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{extractor, fixture, identity, sync_clock, CollectingObserver};
    use tix_core::PointMethod;

    #[test]
    fn drivetexas_fixture_maps_features() {
        let (extractor, identity, observer) = (extractor(), identity(), CollectingObserver::default());
        let ctx = TransformContext {
            extractor: &extractor,
            identity: &identity,
            observer: &observer,
            now: sync_clock(),
        };

        let out = DriveTexasTransformer.transform(&fixture("drivetexas"), &ctx);

        assert_eq!(out.input_records, 5);
        assert_eq!(out.incidents.len(), 3);
        assert_eq!(out.dropped, 2);

        let by_id = |id: &str| {
            out.incidents
                .iter()
                .find(|i| i.source_event_id == id)
                .unwrap()
                .clone()
        };

        let crash = by_id("{AB12}");
        assert_eq!(crash.uuid, "f6b1a036-84a8-520c-be83-c4c3fe6c4316");
        assert_eq!(crash.county.as_deref(), Some("227"));
        assert_eq!(crash.milepost, Some(234.1));
        assert_eq!(crash.closure_status, ClosureStatus::Closed);
        assert_eq!(crash.severity_flag, SeverityFlag::Medium);
        assert_eq!((crash.longitude, crash.latitude), (-97.7431, 30.2672));
        assert!(crash.is_active);

        let lane = by_id("GID-1");
        assert_eq!(lane.uuid, "2cb497f3-97ad-52a8-a9d2-07b3b41b1fd0");
        assert_eq!((lane.longitude, lane.latitude), (-96.81, 32.71));
        assert_eq!(lane.closure_status, ClosureStatus::Partial);
        assert_eq!(lane.severity_flag, SeverityFlag::Low);
        assert!(!lane.is_active);

        let multi = by_id("GID-2");
        assert_eq!(multi.uuid, "7ecc200f-c0c5-524a-9279-e50853ecd846");
        assert_eq!((multi.longitude, multi.latitude), (-95.37, 29.77));
        assert_eq!(multi.route.as_deref(), Some("Unknown Route"));
        assert_eq!(multi.closure_status, ClosureStatus::Unknown);

        let points = observer.points.lock().unwrap();
        assert!(points
            .iter()
            .any(|(id, p)| id == "GID-1" && p.method == PointMethod::Midpoint));
        let drops = observer.drops.lock().unwrap();
        assert!(drops
            .iter()
            .any(|d| d.source_event_id.as_deref() == Some("GID-3")
                && d.reason == DropReason::MissingCoordinates));
    }

    #[test]
    fn itravel_fixture_maps_severity_grades_and_active_flag() {
        let (extractor, identity, observer) = (extractor(), identity(), CollectingObserver::default());
        let ctx = TransformContext {
            extractor: &extractor,
            identity: &identity,
            observer: &observer,
            now: sync_clock(),
        };

        let out = DriveTexasItravelTransformer.transform(&fixture("drivetexas-itravel"), &ctx);

        assert_eq!(out.input_records, 5);
        assert_eq!(out.incidents.len(), 3);
        assert_eq!(out.dropped, 2);

        let by_id = |id: &str| {
            out.incidents
                .iter()
                .find(|i| i.source_event_id == id)
                .unwrap()
                .clone()
        };

        let wreck = by_id("9001");
        assert_eq!(wreck.uuid, identity.assign("TX-ITRAVEL", "9001").to_string());
        assert_eq!(wreck.source_system, "DriveTexas_iTravel");
        assert_eq!(wreck.state.as_deref(), Some("TX"));
        assert_eq!(wreck.route.as_deref(), Some("IH-35"));
        assert_eq!(wreck.severity_flag, SeverityFlag::Critical);
        assert_eq!(wreck.severity_score, Some(95));
        assert_eq!(wreck.closure_status, ClosureStatus::Unknown);
        assert!(wreck.is_active);
        assert_eq!(wreck.cleared_time, None);

        let cleared = by_id("9002");
        assert_eq!(cleared.severity_flag, SeverityFlag::Medium);
        assert_eq!(cleared.severity_score, Some(50));
        assert!(!cleared.is_active);
        assert_eq!(cleared.cleared_time, Some(cleared.updated_time));

        let ungraded = by_id("9003");
        assert_eq!(ungraded.severity_flag, SeverityFlag::Low);
        assert_eq!(ungraded.severity_score, Some(25));
        assert_eq!(ungraded.event_type.as_deref(), Some("Unknown"));
        assert_eq!(ungraded.updated_time, sync_clock());

        let drops = observer.drops.lock().unwrap();
        assert!(drops.iter().any(|d| d.reason == DropReason::MissingId));
        assert!(drops
            .iter()
            .any(|d| d.source_event_id.as_deref() == Some("9004")
                && d.reason == DropReason::MissingCoordinates));
    }

    #[test]
    fn shoulder_blocked_is_partial() {
        assert_eq!(
            closure_from_description(Some("Shoulder blocked near exit 12")),
            ClosureStatus::Partial
        );
        assert_eq!(closure_from_description(None), ClosureStatus::Unknown);
    }
}
