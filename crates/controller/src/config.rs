//! TOML config file loading, validation, and database seeding for zones and
//! controller tunables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::db::{Db, ALL_ZONES};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerCfg,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerCfg {
    pub sweep_interval_sec: u64,
    pub resync_every_ticks: u64,
    pub grace_min: u64,
    pub alert_interval_sec: u64,
    /// How far ahead `load` arms schedule entries.
    pub schedule_horizon_hours: u64,
}

impl Default for ControllerCfg {
    fn default() -> Self {
        Self {
            sweep_interval_sec: 60,
            resync_every_ticks: 5,
            grace_min: 5,
            alert_interval_sec: 30,
            schedule_horizon_hours: 48,
        }
    }
}

impl ControllerCfg {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_sec)
    }
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_min * 60)
    }
    pub fn alert_interval(&self) -> Duration {
        Duration::from_secs(self.alert_interval_sec)
    }
    pub fn schedule_horizon(&self) -> Duration {
        Duration::from_secs(self.schedule_horizon_hours * 3600)
    }
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub id: i64,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_zones(&mut errors);
        self.validate_controller(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || format!("zones[{i}] (id {})", z.id);

            if z.id == ALL_ZONES {
                errors.push(format!(
                    "{}: zone id 0 is reserved for the all-zones target",
                    ctx()
                ));
            } else if z.id < 0 {
                errors.push(format!("{}: zone id must be positive", ctx()));
            } else if !seen_ids.insert(z.id) {
                errors.push(format!("{}: duplicate zone id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if c.sweep_interval_sec == 0 {
            errors.push("controller: sweep_interval_sec must be positive".to_string());
        }
        if c.resync_every_ticks == 0 {
            errors.push("controller: resync_every_ticks must be positive".to_string());
        }
        if c.alert_interval_sec == 0 {
            errors.push("controller: alert_interval_sec must be positive".to_string());
        }
        if c.schedule_horizon_hours == 0 {
            errors.push("controller: schedule_horizon_hours must be positive".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & seeding
// ---------------------------------------------------------------------------

pub fn load(path: &str) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {path}"))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("failed to parse config file: {path}"))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Seed the store: upsert configured zones and make sure the control row and
/// the rain sensor row exist.
pub async fn apply(cfg: &Config, db: &Db) -> Result<()> {
    for z in &cfg.zones {
        db.upsert_zone(z.id, &z.name)
            .await
            .with_context(|| format!("failed to seed zone {}", z.id))?;
    }
    db.ensure_control_row().await.context("failed to seed control row")?;
    db.ensure_rain_sensor().await.context("failed to seed rain sensor")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
