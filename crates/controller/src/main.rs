mod alerts;
mod config;
mod db;
mod events;
mod scheduler;
mod sweep;
mod weather;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alerts::AlertEngine;
use db::Db;
use events::IrrigationEvent;
use scheduler::Scheduler;
use weather::NoWeather;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Database ────────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed zones + control + sensors) ────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // Zone config in the DB is the source of truth from here on.
    let zones = db.load_zones().await?;
    if zones.is_empty() {
        warn!("no zones configured in the database");
    }
    info!(zones = zones.len(), "db ready");

    // ── Scheduler ───────────────────────────────────────────────────
    let scheduler = Scheduler::new(db.clone(), cfg.controller.schedule_horizon());
    match scheduler.load().await {
        Ok(count) => info!(count, "schedule mirror loaded"),
        // The sweep resyncs periodically, so a failed first load is not fatal.
        Err(e) => warn!("initial schedule load failed, sweep will retry: {e}"),
    }

    // ── Event log ───────────────────────────────────────────────────
    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            match ev {
                IrrigationEvent::IrrigationStarted {
                    schedule_id,
                    zone_name,
                    duration_min,
                    ..
                } => info!(schedule_id, zone = %zone_name, duration_min, "irrigation started"),
                IrrigationEvent::IrrigationStopped {
                    schedule_id,
                    zone_name,
                    manual,
                    ..
                } => info!(schedule_id, zone = %zone_name, manual, "irrigation stopped"),
            }
        }
    });

    // ── Alert engine ────────────────────────────────────────────────
    let engine = AlertEngine::new(
        db.clone(),
        Arc::new(NoWeather),
        cfg.controller.alert_interval(),
        cfg.controller.grace(),
    );
    tokio::spawn(engine.run());

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        scheduler: scheduler.clone(),
        db: db.clone(),
    };
    tokio::spawn(web::serve(web_state));

    // ── Reconciliation sweep (runs forever) ─────────────────────────
    let sweep_cfg = sweep::SweepConfig {
        interval: cfg.controller.sweep_interval(),
        resync_every: cfg.controller.resync_every_ticks,
        grace: cfg.controller.grace(),
    };
    sweep::run(scheduler, db, sweep_cfg).await;

    Ok(())
}
