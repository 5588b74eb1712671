//! Alert rule engine: a periodic poll evaluating threshold rules against
//! zones, schedule entries, the control flag, and the weather feed, producing
//! deduplicated alert records.
//!
//! Deduplication is a read-then-insert check on (code, zone). That is the
//! engine's only consistency mechanism; two controller processes against the
//! same store could still race into duplicates. One process is the deployment
//! model here.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::db::{now_unix, Alert, Db, NewAlert, Severity, StoreError, Zone};
use crate::weather::WeatherSource;

/// Deduplication codes. `unexpected_stop` is raised by the reconciliation
/// sweep, which owns the running map the rule keys off.
pub mod codes {
    pub const LOW_HUMIDITY: &str = "low_humidity";
    pub const HIGH_HUMIDITY_90: &str = "high_humidity_90";
    pub const SATURATION: &str = "saturation";
    pub const OPTIMAL_HUMIDITY: &str = "optimal_humidity";
    pub const IRRIGATION_NOT_STARTED: &str = "irrigation_not_started";
    pub const UNEXPECTED_STOP: &str = "unexpected_stop";
    pub const RAIN_DETECTED: &str = "rain_detected";
    pub const HIGH_TEMPERATURE: &str = "high_temperature";
    pub const FROST_RISK: &str = "frost_risk";
    pub const NO_WATER_SUPPLY: &str = "no_water_supply";
}

/// Insert the alert unless a non-dismissed one with the same (code, zone)
/// already exists. Returns whether a new alert was created.
pub async fn raise(db: &Db, alert: NewAlert) -> Result<bool, StoreError> {
    if db.find_open_alert(&alert.code, alert.zone_id).await?.is_some() {
        return Ok(false);
    }
    let id = db.insert_alert(&alert, now_unix()).await?;
    info!(alert = id, code = %alert.code, zone = ?alert.zone_id, "alert raised");
    Ok(true)
}

#[derive(Debug, Default, Serialize)]
pub struct AlertStats {
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
    pub success: usize,
    pub total: usize,
}

/// Per-severity counts of open alerts, for the dashboard badge.
pub fn stats(open: &[Alert]) -> AlertStats {
    let mut out = AlertStats::default();
    for alert in open {
        match alert.severity {
            Severity::Critical => out.critical += 1,
            Severity::Warning => out.warning += 1,
            Severity::Info => out.info += 1,
            Severity::Success => out.success += 1,
        }
        out.total += 1;
    }
    out
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct AlertEngine {
    db: Db,
    weather: Arc<dyn WeatherSource>,
    interval: Duration,
    /// How long past its start time a schedule entry may be before the
    /// not-started rule fires.
    grace: Duration,
}

impl AlertEngine {
    pub fn new(db: Db, weather: Arc<dyn WeatherSource>, interval: Duration, grace: Duration) -> Self {
        Self {
            db,
            weather,
            interval,
            grace,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_sec = self.interval.as_secs(), "alert engine started");
        loop {
            ticker.tick().await;
            self.evaluate().await;
        }
    }

    /// One engine activation. Rule groups are evaluated in isolation so a
    /// failure in one never skips the others.
    pub async fn evaluate(&self) {
        if let Err(e) = self.check_zone_humidity().await {
            warn!("alerts: humidity rules failed: {e}");
        }
        if let Err(e) = self.check_schedule_delays().await {
            warn!("alerts: schedule rules failed: {e}");
        }
        if let Err(e) = self.check_weather().await {
            warn!("alerts: weather rules failed: {e}");
        }
        if let Err(e) = self.check_supply().await {
            warn!("alerts: supply rule failed: {e}");
        }
    }

    async fn check_zone_humidity(&self) -> Result<(), StoreError> {
        for zone in self.db.load_zones().await? {
            if let Err(e) = self.humidity_rules(&zone).await {
                warn!(zone = zone.id, "alerts: humidity rule failed: {e}");
            }
        }
        Ok(())
    }

    async fn humidity_rules(&self, zone: &Zone) -> Result<(), StoreError> {
        let h = zone.humidity;
        if h < 20.0 {
            raise(
                &self.db,
                NewAlert {
                    severity: Severity::Critical,
                    title: format!("Critical humidity in {}", zone.name),
                    description: format!(
                        "Humidity is at {h:.0}%. Immediate irrigation required."
                    ),
                    zone_id: Some(zone.id),
                    code: codes::LOW_HUMIDITY.to_string(),
                },
            )
            .await?;
        } else if h >= 100.0 {
            let raised = raise(
                &self.db,
                NewAlert {
                    severity: Severity::Warning,
                    title: format!("{} saturated", zone.name),
                    description: format!(
                        "{} reached full saturation. Irrigation paused automatically.",
                        zone.name
                    ),
                    zone_id: Some(zone.id),
                    code: codes::SATURATION.to_string(),
                },
            )
            .await?;
            if raised {
                self.db.set_zone_active(zone.id, false).await?;
                info!(zone = zone.id, "zone deactivated: saturated");
            }
        } else if h >= 90.0 {
            raise(
                &self.db,
                NewAlert {
                    severity: Severity::Warning,
                    title: format!("Humidity sensor at {h:.0}%"),
                    description: format!(
                        "{} reads {h:.0}% humidity. Consider reducing irrigation frequency.",
                        zone.name
                    ),
                    zone_id: Some(zone.id),
                    code: codes::HIGH_HUMIDITY_90.to_string(),
                },
            )
            .await?;
        } else if (75.0..85.0).contains(&h) {
            raise(
                &self.db,
                NewAlert {
                    severity: Severity::Info,
                    title: format!("Humidity sensor at {h:.0}%"),
                    description: format!(
                        "{} reached {h:.0}% humidity, the optimal level for established plants.",
                        zone.name
                    ),
                    zone_id: Some(zone.id),
                    code: codes::OPTIMAL_HUMIDITY.to_string(),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn check_schedule_delays(&self) -> Result<(), StoreError> {
        let now = now_unix();
        let cutoff = now - self.grace.as_secs() as i64;
        for entry in self.db.overdue_schedules(cutoff).await? {
            let minutes_late = (now - entry.scheduled_time) / 60;
            raise(
                &self.db,
                NewAlert {
                    severity: Severity::Warning,
                    title: "Scheduled irrigation not started".to_string(),
                    description: format!(
                        "Entry {} for zone {} should have started {minutes_late} minutes ago.",
                        entry.id, entry.zone_id
                    ),
                    zone_id: Some(entry.zone_id),
                    code: codes::IRRIGATION_NOT_STARTED.to_string(),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn check_weather(&self) -> Result<(), StoreError> {
        if self.db.rain_sensor_active().await? {
            let raised = raise(
                &self.db,
                NewAlert {
                    severity: Severity::Info,
                    title: "Rain detected".to_string(),
                    description: "Rain sensor active. All irrigation paused automatically."
                        .to_string(),
                    zone_id: None,
                    code: codes::RAIN_DETECTED.to_string(),
                },
            )
            .await?;
            if raised {
                self.db.set_all_zones_active(false).await?;
                info!("all zones deactivated: rain detected");
            }
        }

        let Some(reading) = self.weather.current().await else {
            return Ok(());
        };
        if reading.temp_c > 35.0 {
            raise(
                &self.db,
                NewAlert {
                    severity: Severity::Warning,
                    title: "High temperature".to_string(),
                    description: format!(
                        "Current temperature: {:.0}°C. Consider increasing irrigation frequency.",
                        reading.temp_c
                    ),
                    zone_id: None,
                    code: codes::HIGH_TEMPERATURE.to_string(),
                },
            )
            .await?;
        }
        if reading.temp_c < 5.0 {
            let raised = raise(
                &self.db,
                NewAlert {
                    severity: Severity::Warning,
                    title: "Frost risk".to_string(),
                    description: format!(
                        "Current temperature: {:.0}°C. Irrigation suspended to prevent freeze damage.",
                        reading.temp_c
                    ),
                    zone_id: None,
                    code: codes::FROST_RISK.to_string(),
                },
            )
            .await?;
            if raised {
                self.db.set_all_zones_active(false).await?;
                info!("all zones deactivated: frost risk");
            }
        }
        Ok(())
    }

    async fn check_supply(&self) -> Result<(), StoreError> {
        if !self.db.control_active().await? && !self.db.active_zones().await?.is_empty() {
            raise(
                &self.db,
                NewAlert {
                    severity: Severity::Critical,
                    title: "No water supply".to_string(),
                    description: "Zones are active but the master control is off. \
                                  Check the pump and main valve."
                        .to_string(),
                    zone_id: None,
                    code: codes::NO_WATER_SUPPLY.to_string(),
                },
            )
            .await?;
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weather::{FixedWeather, NoWeather};

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_zone(1, "North field").await.unwrap();
        db.upsert_zone(2, "South field").await.unwrap();
        db.ensure_control_row().await.unwrap();
        db.ensure_rain_sensor().await.unwrap();
        // Sensible mid-range default so only seeded values trip rules.
        db.set_zone_humidity(1, 50.0).await.unwrap();
        db.set_zone_humidity(2, 50.0).await.unwrap();
        db
    }

    fn engine(db: &Db, weather: Arc<dyn WeatherSource>) -> AlertEngine {
        AlertEngine::new(
            db.clone(),
            weather,
            Duration::from_secs(30),
            Duration::from_secs(300),
        )
    }

    async fn open_codes(db: &Db) -> Vec<String> {
        db.open_alerts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.code)
            .collect()
    }

    // -- Humidity rules -----------------------------------------------------

    #[tokio::test]
    async fn low_humidity_alert_created_once_and_again_after_dismiss() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));
        db.set_zone_humidity(1, 10.0).await.unwrap();

        e.evaluate().await;
        e.evaluate().await;

        let open = db.open_alerts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].code, codes::LOW_HUMIDITY);
        assert_eq!(open[0].severity, Severity::Critical);
        assert_eq!(open[0].zone_id, Some(1));

        db.dismiss_alert(open[0].id).await.unwrap();
        e.evaluate().await;

        let open = db.open_alerts().await.unwrap();
        assert_eq!(open.len(), 1, "dismissing re-arms the rule");
    }

    #[tokio::test]
    async fn same_code_on_two_zones_gives_two_alerts() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));
        db.set_zone_humidity(1, 10.0).await.unwrap();
        db.set_zone_humidity(2, 5.0).await.unwrap();

        e.evaluate().await;
        assert_eq!(open_codes(&db).await.len(), 2);
    }

    #[tokio::test]
    async fn saturation_deactivates_the_zone() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));
        db.set_zone_active(1, true).await.unwrap();
        db.set_zone_humidity(1, 100.0).await.unwrap();

        e.evaluate().await;

        assert!(open_codes(&db).await.contains(&codes::SATURATION.to_string()));
        assert!(!db.get_zone(1).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn high_and_optimal_bands_fire_the_right_rules() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));
        db.set_zone_humidity(1, 92.0).await.unwrap();
        db.set_zone_humidity(2, 80.0).await.unwrap();

        e.evaluate().await;

        let open = db.open_alerts().await.unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().any(|a| a.code == codes::HIGH_HUMIDITY_90 && a.zone_id == Some(1)));
        assert!(open.iter().any(|a| a.code == codes::OPTIMAL_HUMIDITY && a.zone_id == Some(2)));
    }

    #[tokio::test]
    async fn mid_range_humidity_stays_quiet() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));

        e.evaluate().await;
        assert!(db.open_alerts().await.unwrap().is_empty());
    }

    // -- Schedule rules -----------------------------------------------------

    #[tokio::test]
    async fn overdue_entry_raises_not_started_warning() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));
        db.insert_schedule(1, now_unix() - 600, 5).await.unwrap();

        e.evaluate().await;

        let open = db.open_alerts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].code, codes::IRRIGATION_NOT_STARTED);
        assert_eq!(open[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn entry_within_grace_raises_nothing() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));
        db.insert_schedule(1, now_unix() - 60, 5).await.unwrap();

        e.evaluate().await;
        assert!(db.open_alerts().await.unwrap().is_empty());
    }

    // -- Weather rules ------------------------------------------------------

    #[tokio::test]
    async fn rain_sensor_pauses_all_zones() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));
        db.set_all_zones_active(true).await.unwrap();
        db.set_rain_sensor_active(true).await.unwrap();

        e.evaluate().await;

        assert!(open_codes(&db).await.contains(&codes::RAIN_DETECTED.to_string()));
        assert!(db.active_zones().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn frost_risk_pauses_all_zones() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(FixedWeather(2.0)));
        db.set_all_zones_active(true).await.unwrap();
        // Master flag up so the supply rule stays quiet for this scenario.
        db.set_control_active(true).await.unwrap();

        e.evaluate().await;

        assert_eq!(open_codes(&db).await, vec![codes::FROST_RISK.to_string()]);
        assert!(db.active_zones().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn high_temperature_warns_without_side_effects() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(FixedWeather(40.0)));
        db.set_zone_active(1, true).await.unwrap();
        db.set_control_active(true).await.unwrap();

        e.evaluate().await;

        assert_eq!(open_codes(&db).await, vec![codes::HIGH_TEMPERATURE.to_string()]);
        assert!(db.get_zone(1).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn no_weather_feed_means_no_weather_alerts() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));

        e.evaluate().await;
        assert!(db.open_alerts().await.unwrap().is_empty());
    }

    // -- Supply rule ---------------------------------------------------------

    #[tokio::test]
    async fn active_zone_without_control_is_critical() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));
        db.set_zone_active(1, true).await.unwrap();

        e.evaluate().await;

        let open = db.open_alerts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].code, codes::NO_WATER_SUPPLY);
        assert_eq!(open[0].severity, Severity::Critical);
    }

    // -- Stats ---------------------------------------------------------------

    #[tokio::test]
    async fn stats_counts_by_severity() {
        let db = test_db().await;
        let e = engine(&db, Arc::new(NoWeather));
        db.set_zone_humidity(1, 10.0).await.unwrap(); // critical
        db.set_zone_humidity(2, 92.0).await.unwrap(); // warning

        e.evaluate().await;

        let open = db.open_alerts().await.unwrap();
        let s = stats(&open);
        assert_eq!(s.critical, 1);
        assert_eq!(s.warning, 1);
        assert_eq!(s.info, 0);
        assert_eq!(s.total, 2);
    }
}
