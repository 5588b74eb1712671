//! Reconciliation sweep: the periodic process that detects and corrects drift
//! between the scheduler's in-memory maps and what the store says.
//!
//! Each tick, in order:
//! 1. every Nth tick, reload the schedule mirror (rows created elsewhere);
//! 2. start entries overdue past the grace window that nothing is tracking;
//! 3. flag zones marked active with no running irrigation covering them.
//!
//! Step 2 must run before step 3 so zones it just started are not flagged as
//! orphans in the same tick.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::alerts::{self, codes};
use crate::db::{now_unix, Db, NewAlert, Severity, StoreError};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Reload the schedule mirror every this many ticks.
    pub resync_every: u64,
    /// How long past its start time an entry may be before it counts as missed.
    pub grace: Duration,
}

pub async fn run(scheduler: Scheduler, db: Db, cfg: SweepConfig) {
    let mut ticker = tokio::time::interval(cfg.interval);
    let mut tick: u64 = 0;

    info!(
        interval_sec = cfg.interval.as_secs(),
        resync_every = cfg.resync_every,
        grace_sec = cfg.grace.as_secs(),
        "reconciliation sweep started"
    );

    loop {
        ticker.tick().await;
        tick += 1;

        if tick % cfg.resync_every.max(1) == 0 {
            match scheduler.load().await {
                Ok(count) => info!(count, "sweep: schedule mirror resynced"),
                Err(e) => warn!("sweep: resync failed, will retry: {e}"),
            }
        }

        if let Err(e) = check_missed(&scheduler, &db, cfg.grace).await {
            warn!("sweep: missed-execution check failed: {e}");
        }
        if let Err(e) = check_orphans(&scheduler, &db).await {
            warn!("sweep: orphan-active check failed: {e}");
        }
    }
}

/// Start entries overdue past the grace window that have no live timer — the
/// self-healing path for a timer lost to a process restart.
pub(crate) async fn check_missed(
    scheduler: &Scheduler,
    db: &Db,
    grace: Duration,
) -> Result<(), StoreError> {
    let cutoff = now_unix() - grace.as_secs() as i64;
    for entry in db.overdue_schedules(cutoff).await? {
        if scheduler.is_tracked(entry.id) {
            continue;
        }
        let id = entry.id;
        warn!(
            entry = id,
            zone = entry.zone_id,
            scheduled_time = entry.scheduled_time,
            "missed schedule detected — executing now"
        );
        // One entry's failure must not keep the rest from recovering.
        if let Err(e) = scheduler.start(entry).await {
            error!(entry = id, "recovery start failed: {e}");
        }
    }
    Ok(())
}

/// Flag zones marked active that no running irrigation accounts for: a stop
/// was lost. The sweep cannot tell which entry was responsible, so it raises
/// an alert for the operator instead of guessing and auto-stopping.
pub(crate) async fn check_orphans(scheduler: &Scheduler, db: &Db) -> Result<(), StoreError> {
    for zone in db.active_zones().await? {
        if scheduler.running_covers_zone(zone.id) {
            continue;
        }
        let raised = alerts::raise(
            db,
            NewAlert {
                severity: Severity::Critical,
                title: "Irrigation stopped unexpectedly".to_string(),
                description: format!(
                    "Zone {} is marked active but no running irrigation covers it. \
                     Check the valve and stop it manually if needed.",
                    zone.name
                ),
                zone_id: Some(zone.id),
                code: codes::UNEXPECTED_STOP.to_string(),
            },
        )
        .await?;
        if raised {
            warn!(zone = zone.id, "orphan-active zone flagged");
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
