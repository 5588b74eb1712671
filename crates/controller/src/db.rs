//! Persistence gateway: typed async operations over the SQLite store for the
//! four record kinds (zones, schedule entries, the control flag, alerts) plus
//! the auxiliary sensor rows.
//!
//! The store is the single source of truth; every in-memory structure in this
//! crate is a cache reconciled against it. No transactions are used — the
//! multi-step start/stop sequences in the scheduler are designed to be
//! retryable under partial failure instead.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;

/// Target id meaning "every zone" on a schedule entry.
pub const ALL_ZONES: i64 = 0;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is unreachable. Transient — retried on the next sweep tick.
    #[error("store unavailable: {0}")]
    Unavailable(sqlx::Error),
    /// The store rejected the operation. Logged, not retried within a tick.
    #[error("store rejected operation: {0}")]
    Remote(sqlx::Error),
    /// An expected record is missing (deleted by another writer mid-flight).
    #[error("record not found")]
    NotFound,
}

fn classify(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        e @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)) => {
            StoreError::Unavailable(e)
        }
        e => StoreError::Remote(e),
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Zone {
    pub id: i64,
    pub name: String,
    /// Whether water is currently flowing to this zone.
    pub active: bool,
    /// Last-known humidity reading (percent), written by the sensor
    /// ingestion path; this core only reads it.
    pub humidity: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScheduleEntry {
    pub id: i64,
    /// Target zone, or [`ALL_ZONES`].
    pub zone_id: i64,
    pub scheduled_time: i64,
    pub duration_min: i64,
    pub executed: bool,
    pub completed: bool,
    pub cancelled: bool,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
    Success,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Alert {
    pub id: i64,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub zone_id: Option<i64>,
    /// Deduplication code: at most one non-dismissed alert per (code, zone).
    pub code: String,
    pub dismissed: bool,
    pub resolved: bool,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub zone_id: Option<i64>,
    pub code: String,
}

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:irrigation.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database exists per connection, so the pool must not
        // grow past one for it.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Zones
    // ----------------------------

    /// Insert a zone or update its display name, preserving the live
    /// `active`/`humidity` fields on reseed.
    pub async fn upsert_zone(&self, id: i64, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO zones (id, name) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    pub async fn load_zones(&self) -> Result<Vec<Zone>, StoreError> {
        sqlx::query_as::<_, Zone>("SELECT id, name, active, humidity FROM zones ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(classify)
    }

    pub async fn get_zone(&self, id: i64) -> Result<Option<Zone>, StoreError> {
        sqlx::query_as::<_, Zone>("SELECT id, name, active, humidity FROM zones WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)
    }

    pub async fn active_zones(&self) -> Result<Vec<Zone>, StoreError> {
        sqlx::query_as::<_, Zone>(
            "SELECT id, name, active, humidity FROM zones WHERE active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
    }

    pub async fn set_zone_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE zones SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn set_all_zones_active(&self, active: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE zones SET active = ? WHERE id > 0")
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Sensor-ingestion write path; also used to seed tests.
    pub async fn set_zone_humidity(&self, id: i64, humidity: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE zones SET humidity = ? WHERE id = ?")
            .bind(humidity)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    // ----------------------------
    // Schedule entries
    // ----------------------------

    pub async fn insert_schedule(
        &self,
        zone_id: i64,
        scheduled_time: i64,
        duration_min: i64,
    ) -> Result<ScheduleEntry, StoreError> {
        let res = sqlx::query(
            "INSERT INTO schedule (zone_id, scheduled_time, duration_min) VALUES (?, ?, ?)",
        )
        .bind(zone_id)
        .bind(scheduled_time)
        .bind(duration_min)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        self.get_schedule(res.last_insert_rowid())
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Option<ScheduleEntry>, StoreError> {
        sqlx::query_as::<_, ScheduleEntry>("SELECT * FROM schedule WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)
    }

    /// Entries not yet executed whose start time falls in [now, until],
    /// ascending by start time.
    pub async fn pending_schedules(
        &self,
        now: i64,
        until: i64,
    ) -> Result<Vec<ScheduleEntry>, StoreError> {
        sqlx::query_as::<_, ScheduleEntry>(
            "SELECT * FROM schedule
             WHERE executed = 0 AND completed = 0
               AND scheduled_time >= ? AND scheduled_time <= ?
             ORDER BY scheduled_time ASC",
        )
        .bind(now)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
    }

    /// Entries that should have started at or before `cutoff` but never did.
    pub async fn overdue_schedules(&self, cutoff: i64) -> Result<Vec<ScheduleEntry>, StoreError> {
        sqlx::query_as::<_, ScheduleEntry>(
            "SELECT * FROM schedule
             WHERE executed = 0 AND completed = 0 AND scheduled_time <= ?
             ORDER BY scheduled_time ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
    }

    pub async fn mark_executed(&self, id: i64, started_at: i64) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE schedule SET executed = 1, started_at = ? WHERE id = ?")
            .bind(started_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn mark_completed(
        &self,
        id: i64,
        completed_at: i64,
        cancelled: bool,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE schedule SET completed = 1, completed_at = ?, cancelled = ? WHERE id = ?",
        )
        .bind(completed_at)
        .bind(cancelled)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Returns whether a row was deleted.
    pub async fn delete_schedule(&self, id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM schedule WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Control flag
    // ----------------------------

    pub async fn ensure_control_row(&self) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO control (id, active) VALUES (1, 0) ON CONFLICT(id) DO NOTHING")
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    pub async fn control_active(&self) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT active FROM control WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)
    }

    pub async fn set_control_active(&self, active: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE control SET active = ? WHERE id = 1")
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    // ----------------------------
    // Alerts
    // ----------------------------

    pub async fn insert_alert(&self, alert: &NewAlert, created_at: i64) -> Result<i64, StoreError> {
        let res = sqlx::query(
            "INSERT INTO alerts (severity, title, description, zone_id, code, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(alert.severity)
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(alert.zone_id)
        .bind(&alert.code)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(res.last_insert_rowid())
    }

    /// Deduplication lookup: the non-dismissed alert for (code, zone), if any.
    pub async fn find_open_alert(
        &self,
        code: &str,
        zone_id: Option<i64>,
    ) -> Result<Option<Alert>, StoreError> {
        sqlx::query_as::<_, Alert>(
            "SELECT * FROM alerts WHERE code = ? AND zone_id IS ? AND dismissed = 0 LIMIT 1",
        )
        .bind(code)
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)
    }

    pub async fn open_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        sqlx::query_as::<_, Alert>(
            "SELECT * FROM alerts WHERE dismissed = 0 ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
    }

    /// Returns whether an alert row was updated.
    pub async fn dismiss_alert(&self, id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query("UPDATE alerts SET dismissed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn resolve_alert(&self, id: i64, resolved_at: i64) -> Result<bool, StoreError> {
        let res = sqlx::query("UPDATE alerts SET resolved = 1, resolved_at = ? WHERE id = ?")
            .bind(resolved_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Sensors
    // ----------------------------

    pub async fn ensure_rain_sensor(&self) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sensors (id, kind, active) VALUES (1, 'rain', 0)
             ON CONFLICT(id) DO NOTHING",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    pub async fn rain_sensor_active(&self) -> Result<bool, StoreError> {
        let row = sqlx::query_scalar::<_, bool>(
            "SELECT active FROM sensors WHERE kind = 'rain' LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        Ok(row.unwrap_or(false))
    }

    #[cfg(test)]
    pub async fn set_rain_sensor_active(&self, active: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE sensors SET active = ? WHERE kind = 'rain'")
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_zone(1, "North field").await.unwrap();
        db.upsert_zone(2, "South field").await.unwrap();
        db.ensure_control_row().await.unwrap();
        db.ensure_rain_sensor().await.unwrap();
        db
    }

    // -- Zones ---------------------------------------------------------------

    #[tokio::test]
    async fn upsert_zone_preserves_live_fields() {
        let db = test_db().await;
        db.set_zone_active(1, true).await.unwrap();
        db.set_zone_humidity(1, 42.0).await.unwrap();

        db.upsert_zone(1, "Renamed").await.unwrap();

        let z = db.get_zone(1).await.unwrap().unwrap();
        assert_eq!(z.name, "Renamed");
        assert!(z.active);
        assert_eq!(z.humidity, 42.0);
    }

    #[tokio::test]
    async fn set_zone_active_unknown_zone_is_not_found() {
        let db = test_db().await;
        let err = db.set_zone_active(99, true).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn active_zones_filters_and_orders() {
        let db = test_db().await;
        db.set_zone_active(2, true).await.unwrap();

        let active = db.active_zones().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 2);
    }

    #[tokio::test]
    async fn set_all_zones_active_spares_nothing() {
        let db = test_db().await;
        db.set_all_zones_active(true).await.unwrap();
        assert_eq!(db.active_zones().await.unwrap().len(), 2);

        db.set_all_zones_active(false).await.unwrap();
        assert!(db.active_zones().await.unwrap().is_empty());
    }

    // -- Schedule ------------------------------------------------------------

    #[tokio::test]
    async fn insert_schedule_returns_stored_row() {
        let db = test_db().await;
        let e = db.insert_schedule(1, 1_700_000_000, 5).await.unwrap();
        assert_eq!(e.zone_id, 1);
        assert_eq!(e.duration_min, 5);
        assert!(!e.executed && !e.completed && !e.cancelled);
        assert!(e.started_at.is_none());
    }

    #[tokio::test]
    async fn pending_schedules_window_and_order() {
        let db = test_db().await;
        let now = 1_000_000;
        db.insert_schedule(1, now + 300, 5).await.unwrap();
        db.insert_schedule(1, now + 100, 5).await.unwrap();
        db.insert_schedule(1, now - 100, 5).await.unwrap(); // past: excluded
        db.insert_schedule(1, now + 999_999, 5).await.unwrap(); // beyond window

        let pending = db.pending_schedules(now, now + 1000).await.unwrap();
        let times: Vec<i64> = pending.iter().map(|e| e.scheduled_time).collect();
        assert_eq!(times, vec![now + 100, now + 300]);
    }

    #[tokio::test]
    async fn overdue_excludes_executed_and_completed() {
        let db = test_db().await;
        let now = 1_000_000;
        let missed = db.insert_schedule(1, now - 600, 5).await.unwrap();
        let done = db.insert_schedule(1, now - 600, 5).await.unwrap();
        db.mark_executed(done.id, now - 590).await.unwrap();
        let cancelled = db.insert_schedule(1, now - 600, 5).await.unwrap();
        db.mark_completed(cancelled.id, now - 500, true).await.unwrap();

        let overdue = db.overdue_schedules(now - 300).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, missed.id);
    }

    #[tokio::test]
    async fn mark_executed_then_completed_lifecycle() {
        let db = test_db().await;
        let e = db.insert_schedule(1, 500, 5).await.unwrap();

        db.mark_executed(e.id, 510).await.unwrap();
        let e = db.get_schedule(e.id).await.unwrap().unwrap();
        assert!(e.executed);
        assert_eq!(e.started_at, Some(510));
        assert!(!e.completed);

        db.mark_completed(e.id, 810, false).await.unwrap();
        let e = db.get_schedule(e.id).await.unwrap().unwrap();
        assert!(e.completed);
        assert!(!e.cancelled);
        assert_eq!(e.completed_at, Some(810));
    }

    #[tokio::test]
    async fn delete_schedule_reports_whether_found() {
        let db = test_db().await;
        let e = db.insert_schedule(1, 500, 5).await.unwrap();
        assert!(db.delete_schedule(e.id).await.unwrap());
        assert!(!db.delete_schedule(e.id).await.unwrap());
    }

    // -- Control -------------------------------------------------------------

    #[tokio::test]
    async fn control_flag_roundtrip() {
        let db = test_db().await;
        assert!(!db.control_active().await.unwrap());
        db.set_control_active(true).await.unwrap();
        assert!(db.control_active().await.unwrap());
    }

    // -- Alerts --------------------------------------------------------------

    fn low_humidity_alert(zone_id: Option<i64>) -> NewAlert {
        NewAlert {
            severity: Severity::Critical,
            title: "Critical humidity".into(),
            description: "Humidity is at 10%.".into(),
            zone_id,
            code: "low_humidity".into(),
        }
    }

    #[tokio::test]
    async fn find_open_alert_matches_code_and_zone() {
        let db = test_db().await;
        db.insert_alert(&low_humidity_alert(Some(1)), 100).await.unwrap();

        assert!(db.find_open_alert("low_humidity", Some(1)).await.unwrap().is_some());
        assert!(db.find_open_alert("low_humidity", Some(2)).await.unwrap().is_none());
        assert!(db.find_open_alert("saturation", Some(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_open_alert_handles_null_zone() {
        let db = test_db().await;
        db.insert_alert(&low_humidity_alert(None), 100).await.unwrap();

        assert!(db.find_open_alert("low_humidity", None).await.unwrap().is_some());
        assert!(db.find_open_alert("low_humidity", Some(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dismiss_hides_alert_from_open_queries() {
        let db = test_db().await;
        let id = db.insert_alert(&low_humidity_alert(Some(1)), 100).await.unwrap();

        assert!(db.dismiss_alert(id).await.unwrap());
        assert!(db.find_open_alert("low_humidity", Some(1)).await.unwrap().is_none());
        assert!(db.open_alerts().await.unwrap().is_empty());
        assert!(!db.dismiss_alert(9999).await.unwrap());
    }

    #[tokio::test]
    async fn resolve_keeps_alert_visible() {
        let db = test_db().await;
        let id = db.insert_alert(&low_humidity_alert(Some(1)), 100).await.unwrap();

        assert!(db.resolve_alert(id, 200).await.unwrap());
        let open = db.open_alerts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].resolved);
        assert_eq!(open[0].resolved_at, Some(200));
    }

    // -- Sensors -------------------------------------------------------------

    #[tokio::test]
    async fn rain_sensor_defaults_inactive() {
        let db = test_db().await;
        assert!(!db.rain_sensor_active().await.unwrap());
        db.set_rain_sensor_active(true).await.unwrap();
        assert!(db.rain_sensor_active().await.unwrap());
    }
}
