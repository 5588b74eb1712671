//! Schedule mirror and irrigation executor.
//!
//! The `Scheduler` keeps two maps: `armed` (pending entries with a live delay
//! timer) and `running` (entries currently irrigating, with a live stop
//! timer). Per entry, the lifecycle is Pending → Running → Completed, with
//! Cancelled reachable from either live state via manual stop.
//!
//! There is no store-side locking, so "at most one start per entry" rests on
//! the membership checks both maps get under a single mutex, taken and
//! released before the first await of every start/stop sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, Month, OffsetDateTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::db::{now_unix, Db, ScheduleEntry, StoreError, ALL_ZONES};
use crate::events::IrrigationEvent;

/// Capacity of the notification channel; slow consumers lose old events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A multi-step start/stop sequence failed partway through. The writes that
/// already landed are left in place; the reconciliation sweep surfaces the
/// resulting drift.
#[derive(Debug, Error)]
#[error("irrigation sequence for entry {entry_id} failed at '{step}': {source}")]
pub struct ExecutionFailed {
    pub entry_id: i64,
    pub step: &'static str,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("unknown zone {0}")]
    UnknownZone(i64),
    #[error("duration must be positive, got {0} min")]
    InvalidDuration(i64),
    #[error("recurrence end {until} precedes the first occurrence {first_time}")]
    RecurrenceEndBeforeStart { first_time: i64, until: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// In-memory state
// ---------------------------------------------------------------------------

struct ArmedEntry {
    zone_id: i64,
    zone_name: String,
    fire_at: i64,
    duration_min: i64,
    task: JoinHandle<()>,
}

struct RunningIrrigation {
    zone_id: i64,
    zone_name: String,
    duration_min: i64,
    started_at: i64,
    started: Instant,
    stop_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    armed: HashMap<i64, ArmedEntry>,
    running: HashMap<i64, RunningIrrigation>,
}

// ---------------------------------------------------------------------------
// Read views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveIrrigation {
    pub id: i64,
    pub zone_id: i64,
    pub zone_name: String,
    pub duration_min: i64,
    pub started_at: i64,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
    pub progress_pct: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingIrrigation {
    pub id: i64,
    pub zone_id: i64,
    pub zone_name: String,
    pub scheduled_time: i64,
    pub duration_min: i64,
    pub starts_in_sec: i64,
}

// ---------------------------------------------------------------------------
// Recurrence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Weekly,
    Biweekly,
    Monthly,
}

/// Occurrences of the recurrence from `first` through `until` inclusive,
/// ascending. Monthly keeps the day-of-month, clamped to the target month's
/// length; later occurrences step from the clamped date.
fn expand_recurrence(first: i64, recurrence: Recurrence, until: i64) -> Vec<i64> {
    let mut out = Vec::new();
    let mut at = first;
    while at <= until {
        out.push(at);
        at = match next_occurrence(at, recurrence) {
            Some(next) => next,
            None => break,
        };
    }
    out
}

fn next_occurrence(at: i64, recurrence: Recurrence) -> Option<i64> {
    const DAY: i64 = 86_400;
    match recurrence {
        Recurrence::Weekly => Some(at + 7 * DAY),
        Recurrence::Biweekly => Some(at + 14 * DAY),
        Recurrence::Monthly => {
            let dt = OffsetDateTime::from_unix_timestamp(at).ok()?;
            let (year, month) = match dt.month() {
                Month::December => (dt.year() + 1, Month::January),
                m => (dt.year(), m.next()),
            };
            let day = dt.day().min(time::util::days_in_year_month(year, month));
            let date = Date::from_calendar_date(year, month, day).ok()?;
            Some(dt.replace_date(date).unix_timestamp())
        }
    }
}

/// End of December 31 of the year after the first occurrence.
fn default_recurrence_end(first: i64) -> i64 {
    let Ok(start) = OffsetDateTime::from_unix_timestamp(first) else {
        return first;
    };
    match Date::from_calendar_date(start.year() + 1, Month::December, 31) {
        Ok(last) => last
            .with_time(time::macros::time!(23:59:59))
            .assume_utc()
            .unix_timestamp(),
        Err(_) => first,
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Constructed once at startup and handed by clone to the sweep, the alert
/// engine, and the web layer. All clones share the same maps and channel.
#[derive(Clone)]
pub struct Scheduler {
    db: Db,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<IrrigationEvent>,
    horizon_sec: i64,
}

impl Scheduler {
    pub fn new(db: Db, horizon: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
            horizon_sec: horizon.as_secs() as i64,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IrrigationEvent> {
        self.events.subscribe()
    }

    // ----------------------------
    // Schedule mirror
    // ----------------------------

    /// Fetch pending entries inside the load horizon and arm each one.
    /// Entries already armed or running are left alone, so re-loading to pick
    /// up rows created by other writers is safe. Returns how many entries the
    /// store reported.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let now = now_unix();
        let entries = self.db.pending_schedules(now, now + self.horizon_sec).await?;
        let count = entries.len();
        for entry in entries {
            self.arm(entry).await;
        }
        debug!(count, "schedule mirror loaded");
        Ok(count)
    }

    /// Arm a delay timer for an entry, or start it immediately when its time
    /// has already passed — a timer armed with a non-positive delay would
    /// fire instantly anyway, through a path that is harder to reason about.
    pub async fn arm(&self, entry: ScheduleEntry) {
        let delay = entry.scheduled_time - now_unix();
        if delay <= 0 {
            let id = entry.id;
            if let Err(e) = self.start(entry).await {
                error!(entry = id, "immediate start failed: {e}");
            }
            return;
        }

        let zone_name = self.display_name(entry.zone_id).await;

        let mut st = self.inner.lock().unwrap();
        if st.armed.contains_key(&entry.id) || st.running.contains_key(&entry.id) {
            return;
        }

        let sched = self.clone();
        let fire = entry.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay as u64)).await;
            let id = fire.id;
            // Drop our own armed record first; start() aborts whatever armed
            // task it finds, and that must never be the one running it.
            sched.inner.lock().unwrap().armed.remove(&id);
            if let Err(e) = sched.start(fire).await {
                error!(entry = id, "timed start failed: {e}");
            }
        });

        debug!(
            entry = entry.id,
            zone = entry.zone_id,
            delay_sec = delay,
            "schedule armed"
        );
        st.armed.insert(
            entry.id,
            ArmedEntry {
                zone_id: entry.zone_id,
                zone_name,
                fire_at: entry.scheduled_time,
                duration_min: entry.duration_min,
                task,
            },
        );
    }

    /// Drop an armed timer. Persisted state is untouched; the caller decides
    /// what happens to the backing row. Returns whether a timer was found.
    pub fn cancel_schedule(&self, entry_id: i64) -> bool {
        let mut st = self.inner.lock().unwrap();
        match st.armed.remove(&entry_id) {
            Some(armed) => {
                armed.task.abort();
                info!(entry = entry_id, "armed schedule cancelled");
                true
            }
            None => false,
        }
    }

    /// Validate, persist, and arm a new schedule entry.
    pub async fn schedule_irrigation(
        &self,
        zone_id: i64,
        scheduled_time: i64,
        duration_min: i64,
    ) -> Result<ScheduleEntry, ScheduleError> {
        if duration_min <= 0 {
            return Err(ScheduleError::InvalidDuration(duration_min));
        }
        if zone_id != ALL_ZONES && self.db.get_zone(zone_id).await?.is_none() {
            return Err(ScheduleError::UnknownZone(zone_id));
        }

        let entry = self
            .db
            .insert_schedule(zone_id, scheduled_time, duration_min)
            .await?;
        info!(
            entry = entry.id,
            zone = zone_id,
            at = scheduled_time,
            duration_min,
            "irrigation scheduled"
        );
        self.arm(entry.clone()).await;
        Ok(entry)
    }

    /// Expand a recurrence into individual schedule rows, one per occurrence
    /// from `first_time` through `until` inclusive, and arm each. Without an
    /// explicit end the series runs through December 31 of the following
    /// year.
    pub async fn schedule_recurring(
        &self,
        zone_id: i64,
        first_time: i64,
        duration_min: i64,
        recurrence: Recurrence,
        until: Option<i64>,
    ) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        if duration_min <= 0 {
            return Err(ScheduleError::InvalidDuration(duration_min));
        }
        if zone_id != ALL_ZONES && self.db.get_zone(zone_id).await?.is_none() {
            return Err(ScheduleError::UnknownZone(zone_id));
        }
        let until = until.unwrap_or_else(|| default_recurrence_end(first_time));
        if until < first_time {
            return Err(ScheduleError::RecurrenceEndBeforeStart { first_time, until });
        }

        let mut entries = Vec::new();
        for at in expand_recurrence(first_time, recurrence, until) {
            let entry = self.db.insert_schedule(zone_id, at, duration_min).await?;
            self.arm(entry.clone()).await;
            entries.push(entry);
        }
        info!(
            zone = zone_id,
            count = entries.len(),
            ?recurrence,
            until,
            "recurring irrigation scheduled"
        );
        Ok(entries)
    }

    // ----------------------------
    // Executor
    // ----------------------------

    /// Start irrigating the entry's target zone(s). Idempotent: a second call
    /// while the entry is running is a no-op. The membership check and the
    /// reservation happen under the lock before the first await, which is
    /// what keeps two interleaved callers from both committing the sequence.
    pub async fn start(&self, entry: ScheduleEntry) -> Result<(), ExecutionFailed> {
        let entry_id = entry.id;
        let started_at = now_unix();
        {
            let mut st = self.inner.lock().unwrap();
            if st.running.contains_key(&entry_id) {
                debug!(entry = entry_id, "start skipped: already running");
                return Ok(());
            }
            if let Some(armed) = st.armed.remove(&entry_id) {
                armed.task.abort();
            }
            st.running.insert(
                entry_id,
                RunningIrrigation {
                    zone_id: entry.zone_id,
                    zone_name: String::new(),
                    duration_min: entry.duration_min,
                    started_at,
                    started: Instant::now(),
                    stop_task: None,
                },
            );
        }

        // A concurrent stop clears the reservation, so re-check it before
        // every write: an interleaved stop wins instead of being overwritten.
        if !self.reserved(entry_id) {
            return Ok(());
        }
        self.activate_zones(entry.zone_id)
            .await
            .map_err(|e| self.abort_start(entry_id, "activate zones", e))?;

        if !self.reserved(entry_id) {
            // Stopped while the valves were opening; undo the activation.
            if let Err(e) = self.deactivate_zones(entry.zone_id).await {
                error!(entry = entry_id, "rollback of interrupted start failed: {e}");
            }
            return Ok(());
        }
        match self.db.mark_executed(entry_id, started_at).await {
            // Row deleted by another writer mid-flight: nothing to record,
            // the irrigation itself still proceeds.
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(self.abort_start(entry_id, "mark executed", e)),
        }

        let zone_name = self.display_name(entry.zone_id).await;

        let sched = self.clone();
        let run_for = Duration::from_secs(entry.duration_min as u64 * 60);
        let stop_task = tokio::spawn(async move {
            tokio::time::sleep(run_for).await;
            match sched.stop_inner(entry_id, false, true).await {
                Ok(true) => {}
                Ok(false) => debug!(entry = entry_id, "auto-stop: nothing running"),
                Err(e) => error!(entry = entry_id, "auto-stop failed: {e}"),
            }
        });

        {
            let mut st = self.inner.lock().unwrap();
            match st.running.get_mut(&entry_id) {
                Some(run) => {
                    run.zone_name = zone_name.clone();
                    run.stop_task = Some(stop_task);
                }
                // Manually stopped while the writes above were in flight.
                None => {
                    stop_task.abort();
                    return Ok(());
                }
            }
        }

        info!(
            entry = entry_id,
            zone = entry.zone_id,
            duration_min = entry.duration_min,
            "irrigation started"
        );
        let _ = self.events.send(IrrigationEvent::IrrigationStarted {
            schedule_id: entry_id,
            zone_id: entry.zone_id,
            zone_name,
            duration_min: entry.duration_min,
        });
        Ok(())
    }

    /// Stop a running irrigation. Returns false when the entry is not in the
    /// running map (double stop, or never started).
    pub async fn stop(&self, entry_id: i64, manual: bool) -> Result<bool, ExecutionFailed> {
        self.stop_inner(entry_id, manual, false).await
    }

    /// Operator-facing stop: covers a running irrigation, and also a pending
    /// entry whose timer has not fired yet — that one is cancelled outright
    /// and its row closed as cancelled.
    pub async fn stop_manually(&self, entry_id: i64) -> Result<bool, ExecutionFailed> {
        if self.stop_inner(entry_id, true, false).await? {
            return Ok(true);
        }
        if self.cancel_schedule(entry_id) {
            match self.db.mark_completed(entry_id, now_unix(), true).await {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => {
                    return Err(ExecutionFailed {
                        entry_id,
                        step: "mark cancelled",
                        source: e,
                    })
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// `from_timer` marks the call made by the entry's own stop task, which
    /// must not abort itself.
    async fn stop_inner(
        &self,
        entry_id: i64,
        manual: bool,
        from_timer: bool,
    ) -> Result<bool, ExecutionFailed> {
        let run = {
            let mut st = self.inner.lock().unwrap();
            match st.running.remove(&entry_id) {
                Some(run) => run,
                None => return Ok(false),
            }
        };
        if !from_timer {
            if let Some(task) = &run.stop_task {
                task.abort();
            }
        }

        self.deactivate_zones(run.zone_id)
            .await
            .map_err(|e| ExecutionFailed {
                entry_id,
                step: "deactivate zones",
                source: e,
            })?;
        match self.db.mark_completed(entry_id, now_unix(), manual).await {
            // Row already deleted: nothing to close, the stop still counts.
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => {
                return Err(ExecutionFailed {
                    entry_id,
                    step: "mark completed",
                    source: e,
                })
            }
        }

        info!(
            entry = entry_id,
            zone = run.zone_id,
            manual,
            "irrigation stopped"
        );
        let _ = self.events.send(IrrigationEvent::IrrigationStopped {
            schedule_id: entry_id,
            zone_id: run.zone_id,
            zone_name: run.zone_name,
            manual,
        });
        Ok(true)
    }

    /// Whether the entry still holds its `running` reservation.
    fn reserved(&self, entry_id: i64) -> bool {
        self.inner.lock().unwrap().running.contains_key(&entry_id)
    }

    /// Clear the reservation made at the top of `start` and wrap the failure.
    fn abort_start(&self, entry_id: i64, step: &'static str, source: StoreError) -> ExecutionFailed {
        self.inner.lock().unwrap().running.remove(&entry_id);
        ExecutionFailed {
            entry_id,
            step,
            source,
        }
    }

    async fn activate_zones(&self, zone_id: i64) -> Result<(), StoreError> {
        if zone_id == ALL_ZONES {
            self.db.set_all_zones_active(true).await?;
        } else {
            self.db.set_zone_active(zone_id, true).await?;
        }
        self.db.set_control_active(true).await
    }

    async fn deactivate_zones(&self, zone_id: i64) -> Result<(), StoreError> {
        if zone_id == ALL_ZONES {
            self.db.set_all_zones_active(false).await?;
        } else {
            self.db.set_zone_active(zone_id, false).await?;
        }
        // The master flag stays up while any other zone is still irrigating.
        if self.db.active_zones().await?.is_empty() {
            self.db.set_control_active(false).await?;
        }
        Ok(())
    }

    async fn display_name(&self, zone_id: i64) -> String {
        if zone_id == ALL_ZONES {
            return "All zones".to_string();
        }
        match self.db.get_zone(zone_id).await {
            Ok(Some(zone)) => zone.name,
            _ => format!("Zone {zone_id}"),
        }
    }

    // ----------------------------
    // Queries for the sweep and the UI
    // ----------------------------

    /// Whether the entry has a live timer (armed) or is running.
    pub fn is_tracked(&self, entry_id: i64) -> bool {
        let st = self.inner.lock().unwrap();
        st.armed.contains_key(&entry_id) || st.running.contains_key(&entry_id)
    }

    /// Whether some running irrigation accounts for this zone being active.
    /// A running all-zones entry covers every zone.
    pub fn running_covers_zone(&self, zone_id: i64) -> bool {
        let st = self.inner.lock().unwrap();
        st.running
            .values()
            .any(|run| run.zone_id == ALL_ZONES || run.zone_id == zone_id)
    }

    pub fn active_irrigations(&self) -> Vec<ActiveIrrigation> {
        let st = self.inner.lock().unwrap();
        let mut out: Vec<ActiveIrrigation> = st
            .running
            .iter()
            .map(|(&id, run)| {
                let total_ms = run.duration_min as u64 * 60_000;
                let elapsed_ms = run.started.elapsed().as_millis() as u64;
                ActiveIrrigation {
                    id,
                    zone_id: run.zone_id,
                    zone_name: run.zone_name.clone(),
                    duration_min: run.duration_min,
                    started_at: run.started_at,
                    elapsed_ms,
                    remaining_ms: total_ms.saturating_sub(elapsed_ms),
                    progress_pct: if total_ms == 0 {
                        100.0
                    } else {
                        (elapsed_ms as f64 / total_ms as f64 * 100.0).min(100.0)
                    },
                }
            })
            .collect();
        out.sort_by_key(|a| a.started_at);
        out
    }

    pub fn scheduled_irrigations(&self) -> Vec<PendingIrrigation> {
        let now = now_unix();
        let st = self.inner.lock().unwrap();
        let mut out: Vec<PendingIrrigation> = st
            .armed
            .iter()
            .map(|(&id, armed)| PendingIrrigation {
                id,
                zone_id: armed.zone_id,
                zone_name: armed.zone_name.clone(),
                scheduled_time: armed.fire_at,
                duration_min: armed.duration_min,
                starts_in_sec: armed.fire_at - now,
            })
            .collect();
        out.sort_by_key(|p| p.scheduled_time);
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================
