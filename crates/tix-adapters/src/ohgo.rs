use serde_json::Value as JsonValue;
use tix_core::{is_active_at, ClosureStatus, DropReason, IncidentPayload, SeverityFlag};

use crate::{
    json_bool, json_f64, json_str, json_text, json_time, lookup, record_array, SourceTransformer,
    TransformContext, TransformerKind,
};

const SEVERITY: &[(&str, SeverityFlag)] = &[
    ("LOW", SeverityFlag::Low),
    ("MINOR", SeverityFlag::Low),
    ("MODERATE", SeverityFlag::Medium),
    ("MAJOR", SeverityFlag::High),
    ("CRITICAL", SeverityFlag::Critical),
];

// Checked in order; "PARTIALLY CLOSED" reads as closed.
const ROADWAY_STATUS: &[(&str, ClosureStatus)] = &[
    ("CLOSED", ClosureStatus::Closed),
    ("PARTIAL", ClosureStatus::Partial),
    ("OPEN", ClosureStatus::Open),
];

fn roadway_closure(status: Option<&str>) -> ClosureStatus {
    let Some(status) = status.map(str::to_ascii_uppercase) else {
        return ClosureStatus::Unknown;
    };
    ROADWAY_STATUS
        .iter()
        .find(|(keyword, _)| status.contains(keyword))
        .map(|(_, closure)| *closure)
        .unwrap_or_default()
}

/// Authenticated Ohio incident API: point records with a nested `location`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OhgoTransformer;

impl SourceTransformer for OhgoTransformer {
    fn kind(&self) -> TransformerKind {
        TransformerKind::Ohgo
    }

    fn source_system(&self) -> &'static str {
        "OHGO_Official"
    }

    fn id_prefix(&self) -> &'static str {
        "OHGO"
    }

    fn records<'p>(&self, payload: &'p JsonValue) -> Vec<&'p JsonValue> {
        record_array(payload, &["results"])
    }

    fn native_id(&self, record: &JsonValue) -> Option<String> {
        json_text(record, &["id"])
    }

    fn map_record(
        &self,
        record: &JsonValue,
        source_event_id: &str,
        ctx: &TransformContext<'_>,
    ) -> Result<IncidentPayload, DropReason> {
        let position = ctx.validate_pair(
            json_f64(record, &["location", "latitude"]),
            json_f64(record, &["location", "longitude"]),
        )?;

        let reported_time = json_time(record, &["startTime"]);
        let cleared_time = json_time(record, &["clearedTime"]);
        let updated_time = json_time(record, &["lastUpdatedTime"])
            .or(reported_time)
            .unwrap_or(ctx.now);
        let severity_flag = json_str(record, &["severity"])
            .and_then(|s| lookup(SEVERITY, s.to_ascii_uppercase().as_str()))
            .unwrap_or_default();

        Ok(IncidentPayload {
            uuid: ctx
                .identity
                .assign(self.id_prefix(), source_event_id)
                .to_string(),
            source_system: self.source_system().to_string(),
            source_event_id: source_event_id.to_string(),
            state: Some("OH".to_string()),
            county: json_str(record, &["county"]).map(str::to_string),
            route: Some(
                json_str(record, &["roadwayName"])
                    .unwrap_or("Unknown Route")
                    .to_string(),
            ),
            direction: json_str(record, &["direction"]).map(str::to_string),
            milepost: json_f64(record, &["mileMarker"]),
            latitude: position.lat,
            longitude: position.lon,
            reported_time,
            updated_time,
            cleared_time,
            is_active: is_active_at(cleared_time, ctx.now),
            event_type: Some(
                json_str(record, &["eventType"])
                    .unwrap_or("Unknown Event")
                    .to_string(),
            ),
            lanes_affected: json_str(record, &["description"]).map(str::to_string),
            closure_status: roadway_closure(json_str(record, &["roadwayStatus"])),
            severity_flag,
            severity_score: None,
            units_involved: None,
        })
    }
}

/// Legacy public Ohio construction feed. Flat coordinates, epoch-millisecond
/// timestamps and an explicit `active` flag; no severity vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct OhgoConstructionTransformer;

impl SourceTransformer for OhgoConstructionTransformer {
    fn kind(&self) -> TransformerKind {
        TransformerKind::OhgoConstruction
    }

    fn source_system(&self) -> &'static str {
        "OHGO_Construction"
    }

    fn id_prefix(&self) -> &'static str {
        "OHGO-CONSTRUCTION"
    }

    fn records<'p>(&self, payload: &'p JsonValue) -> Vec<&'p JsonValue> {
        record_array(payload, &["results"])
    }

    fn native_id(&self, record: &JsonValue) -> Option<String> {
        json_text(record, &["eventId"])
    }

    fn map_record(
        &self,
        record: &JsonValue,
        source_event_id: &str,
        ctx: &TransformContext<'_>,
    ) -> Result<IncidentPayload, DropReason> {
        let position = ctx.validate_pair(
            json_f64(record, &["latitude"]),
            json_f64(record, &["longitude"]),
        )?;

        let flagged_active = json_bool(record, &["active"]).unwrap_or(true);
        let reported_time = json_time(record, &["startTime"]);
        let updated_time = json_time(record, &["lastUpdated"]).unwrap_or(ctx.now);
        let mut cleared_time = json_time(record, &["endTime"]);
        if !flagged_active && cleared_time.is_none() {
            cleared_time = Some(updated_time);
        }

        Ok(IncidentPayload {
            uuid: ctx
                .identity
                .assign(self.id_prefix(), source_event_id)
                .to_string(),
            source_system: self.source_system().to_string(),
            source_event_id: source_event_id.to_string(),
            state: Some("OH".to_string()),
            county: json_str(record, &["county"]).map(str::to_string),
            route: json_str(record, &["routeName"]).map(str::to_string),
            direction: json_str(record, &["direction"]).map(str::to_string),
            milepost: json_f64(record, &["startMileMarker"]),
            latitude: position.lat,
            longitude: position.lon,
            reported_time,
            updated_time,
            cleared_time,
            is_active: flagged_active && is_active_at(cleared_time, ctx.now),
            event_type: Some(
                json_str(record, &["eventType"])
                    .unwrap_or("Unknown")
                    .to_string(),
            ),
            lanes_affected: json_str(record, &["lanesAffected"]).map(str::to_string),
            closure_status: ClosureStatus::Unknown,
            severity_flag: SeverityFlag::Low,
            severity_score: None,
            units_involved: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{extractor, fixture, identity, sync_clock, CollectingObserver};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn context<'a>(
        extractor: &'a tix_core::GeometryExtractor,
        identity: &'a tix_core::IdentityAssigner,
        observer: &'a CollectingObserver,
    ) -> TransformContext<'a> {
        TransformContext {
            extractor,
            identity,
            observer,
            now: sync_clock(),
        }
    }

    #[test]
    fn ohgo_fixture_maps_valid_records_and_drops_the_rest() {
        let (extractor, identity, observer) = (extractor(), identity(), CollectingObserver::default());
        let ctx = context(&extractor, &identity, &observer);

        let out = OhgoTransformer.transform(&fixture("ohgo"), &ctx);

        assert_eq!(out.input_records, 4);
        assert_eq!(out.incidents.len(), 2);
        assert_eq!(out.dropped, 2);

        let first = out
            .incidents
            .iter()
            .find(|i| i.source_event_id == "1001")
            .unwrap();
        assert_eq!(first.uuid, "5a7b0e71-f659-539a-ade6-4d75e3ec8d2a");
        assert_eq!(first.source_system, "OHGO_Official");
        assert_eq!(first.state.as_deref(), Some("OH"));
        assert_eq!(first.route.as_deref(), Some("I-71"));
        assert_eq!(first.milepost, Some(101.5));
        assert_eq!(first.closure_status, ClosureStatus::Closed);
        assert_eq!(first.severity_flag, SeverityFlag::High);
        assert!(first.is_active);
        assert_eq!(
            first.updated_time,
            Utc.with_ymd_and_hms(2026, 3, 1, 11, 15, 0).single().unwrap()
        );

        let cleared = out
            .incidents
            .iter()
            .find(|i| i.source_event_id == "1002")
            .unwrap();
        assert_eq!(cleared.uuid, "646a3728-dcc4-53d4-89bc-a1a03392e7f8");
        assert!(!cleared.is_active);
        assert_eq!(cleared.route.as_deref(), Some("Unknown Route"));
        assert_eq!(cleared.event_type.as_deref(), Some("Unknown Event"));
        assert_eq!(cleared.severity_flag, SeverityFlag::Low);
        assert_eq!(cleared.closure_status, ClosureStatus::Unknown);

        let drops = observer.drops.lock().unwrap();
        assert!(drops.iter().any(|d| d.reason == DropReason::MissingId));
        assert!(drops
            .iter()
            .any(|d| matches!(d.reason, DropReason::InvalidCoordinates { .. })));
    }

    #[test]
    fn duplicate_ids_collapse_to_the_last_record() {
        let (extractor, identity, observer) = (extractor(), identity(), CollectingObserver::default());
        let ctx = context(&extractor, &identity, &observer);
        let payload = json!([
            {"id": 7, "location": {"latitude": 40.0, "longitude": -83.0}, "severity": "minor"},
            {"id": "7", "location": {"latitude": 40.0, "longitude": -83.0}, "severity": "critical"}
        ]);

        let out = OhgoTransformer.transform(&payload, &ctx);

        assert_eq!(out.incidents.len(), 1);
        assert_eq!(out.incidents[0].severity_flag, SeverityFlag::Critical);
        assert_eq!(out.incidents[0].updated_time, sync_clock());
    }

    #[test]
    fn roadway_status_keywords_resolve_in_order() {
        assert_eq!(roadway_closure(Some("Partially Closed")), ClosureStatus::Closed);
        assert_eq!(roadway_closure(Some("partial lane")), ClosureStatus::Partial);
        assert_eq!(roadway_closure(Some("Open")), ClosureStatus::Open);
        assert_eq!(roadway_closure(Some("restricted")), ClosureStatus::Unknown);
        assert_eq!(roadway_closure(None), ClosureStatus::Unknown);
    }

    #[test]
    fn construction_feed_reads_epoch_millis_and_active_flag() {
        let (extractor, identity, observer) = (extractor(), identity(), CollectingObserver::default());
        let ctx = context(&extractor, &identity, &observer);

        let out = OhgoConstructionTransformer.transform(&fixture("ohgo-construction"), &ctx);

        assert_eq!(out.incidents.len(), 2);
        let running = out
            .incidents
            .iter()
            .find(|i| i.source_event_id == "C-100")
            .unwrap();
        assert!(running.is_active);
        assert_eq!(running.route.as_deref(), Some("US-33"));
        assert_eq!(running.milepost, Some(12.25));
        assert_eq!(
            running.reported_time,
            Some(Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).single().unwrap())
        );
        assert_eq!(
            running.uuid,
            identity.assign("OHGO-CONSTRUCTION", "C-100").to_string()
        );

        let finished = out
            .incidents
            .iter()
            .find(|i| i.source_event_id == "C-200")
            .unwrap();
        assert!(!finished.is_active);
        assert_eq!(finished.cleared_time, Some(finished.updated_time));
        assert_eq!(finished.event_type.as_deref(), Some("Unknown"));
        assert_eq!(finished.severity_flag, SeverityFlag::Low);
    }
}
