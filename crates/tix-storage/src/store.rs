use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tix_core::{
    format_wire_time, parse_wire_time, BoundingBox, ClosureStatus, IncidentPayload, SeverityFlag,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("importer request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("importer responded with status {status}: {message}")]
    Importer { status: u16, message: String },
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertStats {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn absorb(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

/// Destination for canonical incidents. One call commits one batch atomically.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn upsert_batch(&self, batch: &[IncidentPayload]) -> Result<UpsertStats, StoreError>;
}

const CREATE_INCIDENTS: &str = r#"
CREATE TABLE IF NOT EXISTS incidents (
    uuid            TEXT PRIMARY KEY NOT NULL,
    source_system   TEXT NOT NULL,
    source_event_id TEXT,
    state           TEXT,
    county          TEXT,
    route           TEXT,
    direction       TEXT,
    milepost        REAL,
    latitude        REAL,
    longitude       REAL,
    reported_time   TEXT,
    updated_time    TEXT NOT NULL,
    cleared_time    TEXT,
    is_active       INTEGER NOT NULL DEFAULT 1,
    event_type      TEXT,
    lanes_affected  TEXT,
    closure_status  TEXT,
    severity_flag   TEXT,
    severity_score  INTEGER,
    units_involved  INTEGER
)
"#;

const CREATE_ACTIVE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_incidents_active ON incidents (is_active, updated_time)";

const UPSERT_INCIDENT: &str = r#"
INSERT INTO incidents (
    uuid, source_system, source_event_id, state, county, route,
    direction, milepost, latitude, longitude, reported_time,
    updated_time, cleared_time, is_active, event_type, lanes_affected,
    closure_status, severity_flag, severity_score, units_involved
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (uuid) DO UPDATE SET
    updated_time   = excluded.updated_time,
    cleared_time   = excluded.cleared_time,
    is_active      = excluded.is_active,
    event_type     = excluded.event_type,
    lanes_affected = excluded.lanes_affected,
    closure_status = excluded.closure_status,
    severity_flag  = excluded.severity_flag,
    severity_score = excluded.severity_score,
    units_involved = excluded.units_involved
"#;

// ?1..?4 = min_lat, max_lat, min_lon, max_lon
const PLACEHOLDER_SQL: &str = "(ABS(latitude - 1.0) < 0.0001 AND ABS(longitude - 1.0) < 0.0001)";
const ZERO_SQL: &str = "(latitude = 0 AND longitude = 0)";
const NULL_SQL: &str = "(latitude IS NULL OR longitude IS NULL)";
const LAT_BOUNDS_SQL: &str = "(latitude < ?1 OR latitude > ?2)";
const LON_BOUNDS_SQL: &str = "(longitude < ?3 OR longitude > ?4)";

/// Stored rows that would fail coordinate validation today, grouped by issue.
/// A row can fall under more than one issue; `total` counts it once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinateAudit {
    pub placeholder: i64,
    pub zero: i64,
    pub null: i64,
    pub latitude_out_of_bounds: i64,
    pub longitude_out_of_bounds: i64,
    pub total: i64,
}

#[derive(Debug, Clone)]
pub struct SqliteIncidentStore {
    pool: SqlitePool,
}

impl SqliteIncidentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");
        // An in-memory database lives exactly as long as its one connection.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_INCIDENTS).execute(&self.pool).await?;
        sqlx::query(CREATE_ACTIVE_INDEX).execute(&self.pool).await?;
        info!("incidents schema ready");
        Ok(())
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM incidents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get(&self, uuid: &str) -> Result<Option<IncidentPayload>, StoreError> {
        let row = sqlx::query("SELECT * FROM incidents WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_incident(&r)).transpose()
    }

    pub async fn audit_coordinates(&self, bounds: BoundingBox) -> Result<CoordinateAudit, StoreError> {
        let sql = format!(
            "SELECT \
                COALESCE(SUM(CASE WHEN {PLACEHOLDER_SQL} THEN 1 ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN {ZERO_SQL} THEN 1 ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN {NULL_SQL} THEN 1 ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN {LAT_BOUNDS_SQL} THEN 1 ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN {LON_BOUNDS_SQL} THEN 1 ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN {} THEN 1 ELSE 0 END), 0) \
             FROM incidents",
            invalid_predicate()
        );
        let row = bind_bounds(sqlx::query(&sql), bounds)
            .fetch_one(&self.pool)
            .await?;
        Ok(CoordinateAudit {
            placeholder: row.try_get(0)?,
            zero: row.try_get(1)?,
            null: row.try_get(2)?,
            latitude_out_of_bounds: row.try_get(3)?,
            longitude_out_of_bounds: row.try_get(4)?,
            total: row.try_get(5)?,
        })
    }

    /// Administrative cleanup; the sync path never deletes rows.
    pub async fn purge_invalid_coordinates(&self, bounds: BoundingBox) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM incidents WHERE {}", invalid_predicate());
        let result = bind_bounds(sqlx::query(&sql), bounds)
            .execute(&self.pool)
            .await?;
        info!(deleted = result.rows_affected(), "purged incidents with invalid coordinates");
        Ok(result.rows_affected())
    }
}

fn invalid_predicate() -> String {
    format!("{PLACEHOLDER_SQL} OR {ZERO_SQL} OR {NULL_SQL} OR {LAT_BOUNDS_SQL} OR {LON_BOUNDS_SQL}")
}

fn bind_bounds<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    bounds: BoundingBox,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(bounds.min_lat)
        .bind(bounds.max_lat)
        .bind(bounds.min_lon)
        .bind(bounds.max_lon)
}

fn row_to_incident(row: &SqliteRow) -> Result<IncidentPayload, StoreError> {
    let wire_time = |column: &str| -> Result<Option<chrono::DateTime<chrono::Utc>>, StoreError> {
        let raw: Option<String> = row.try_get(column)?;
        Ok(raw.as_deref().and_then(parse_wire_time))
    };
    let updated_time = wire_time("updated_time")?.ok_or_else(|| {
        StoreError::Rejected("stored incident has an unreadable updated_time".to_string())
    })?;
    let closure: Option<String> = row.try_get("closure_status")?;
    let severity: Option<String> = row.try_get("severity_flag")?;
    let is_active: i64 = row.try_get("is_active")?;

    Ok(IncidentPayload {
        uuid: row.try_get("uuid")?,
        source_system: row.try_get("source_system")?,
        source_event_id: row
            .try_get::<Option<String>, _>("source_event_id")?
            .unwrap_or_default(),
        state: row.try_get("state")?,
        county: row.try_get("county")?,
        route: row.try_get("route")?,
        direction: row.try_get("direction")?,
        milepost: row.try_get("milepost")?,
        latitude: row.try_get::<Option<f64>, _>("latitude")?.unwrap_or_default(),
        longitude: row.try_get::<Option<f64>, _>("longitude")?.unwrap_or_default(),
        reported_time: wire_time("reported_time")?,
        updated_time,
        cleared_time: wire_time("cleared_time")?,
        is_active: is_active != 0,
        event_type: row.try_get("event_type")?,
        lanes_affected: row.try_get("lanes_affected")?,
        closure_status: closure.as_deref().map(ClosureStatus::from_wire).unwrap_or_default(),
        severity_flag: severity.as_deref().map(SeverityFlag::from_wire).unwrap_or_default(),
        severity_score: row.try_get("severity_score")?,
        units_involved: row.try_get("units_involved")?,
    })
}

#[async_trait]
impl IncidentStore for SqliteIncidentStore {
    async fn upsert_batch(&self, batch: &[IncidentPayload]) -> Result<UpsertStats, StoreError> {
        let mut stats = UpsertStats::default();
        let mut tx = self.pool.begin().await?;

        for incident in batch {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM incidents WHERE uuid = ?")
                .bind(&incident.uuid)
                .fetch_one(&mut *tx)
                .await?;

            sqlx::query(UPSERT_INCIDENT)
                .bind(&incident.uuid)
                .bind(&incident.source_system)
                .bind(&incident.source_event_id)
                .bind(&incident.state)
                .bind(&incident.county)
                .bind(&incident.route)
                .bind(&incident.direction)
                .bind(incident.milepost)
                .bind(incident.latitude)
                .bind(incident.longitude)
                .bind(incident.reported_time.as_ref().map(format_wire_time))
                .bind(format_wire_time(&incident.updated_time))
                .bind(incident.cleared_time.as_ref().map(format_wire_time))
                .bind(i64::from(incident.is_active))
                .bind(&incident.event_type)
                .bind(&incident.lanes_affected)
                .bind(incident.closure_status.as_str())
                .bind(incident.severity_flag.as_str())
                .bind(incident.severity_score)
                .bind(incident.units_involved)
                .execute(&mut *tx)
                .await?;

            if exists > 0 {
                stats.updated += 1;
            } else {
                stats.inserted += 1;
            }
        }

        tx.commit().await?;
        debug!(inserted = stats.inserted, updated = stats.updated, "committed incident batch");
        Ok(stats)
    }
}

/// Process-local store keyed by uuid.
#[derive(Debug, Default)]
pub struct MemoryIncidentStore {
    rows: Mutex<BTreeMap<String, IncidentPayload>>,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn get(&self, uuid: &str) -> Option<IncidentPayload> {
        self.rows.lock().await.get(uuid).cloned()
    }
}

#[async_trait]
impl IncidentStore for MemoryIncidentStore {
    async fn upsert_batch(&self, batch: &[IncidentPayload]) -> Result<UpsertStats, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut stats = UpsertStats::default();
        for incident in batch {
            match rows.get_mut(&incident.uuid) {
                Some(existing) => {
                    existing.merge_mutable(incident);
                    stats.updated += 1;
                }
                None => {
                    rows.insert(incident.uuid.clone(), incident.clone());
                    stats.inserted += 1;
                }
            }
        }
        Ok(stats)
    }
}
