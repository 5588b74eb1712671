//! Seam for the external weather feed. The real API client lives outside this
//! core; the alert engine only needs the current temperature, injected through
//! this trait.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy)]
pub struct WeatherReading {
    pub temp_c: f64,
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Latest reading, or None when the feed is unavailable.
    async fn current(&self) -> Option<WeatherReading>;
}

/// Default source when no weather feed is wired up.
pub struct NoWeather;

#[async_trait]
impl WeatherSource for NoWeather {
    async fn current(&self) -> Option<WeatherReading> {
        None
    }
}

/// Constant reading, for tests and manual runs.
pub struct FixedWeather(pub f64);

#[async_trait]
impl WeatherSource for FixedWeather {
    async fn current(&self) -> Option<WeatherReading> {
        Some(WeatherReading { temp_c: self.0 })
    }
}
