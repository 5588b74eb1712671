//! Start/stop notification events consumed by the UI layer. Delivery is
//! fire-and-forget over a broadcast channel, at most once per executor
//! invocation; there is no persistence or replay.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IrrigationEvent {
    IrrigationStarted {
        schedule_id: i64,
        zone_id: i64,
        zone_name: String,
        duration_min: i64,
    },
    IrrigationStopped {
        schedule_id: i64,
        zone_id: i64,
        zone_name: String,
        /// True when stopped by operator action rather than the duration timer.
        manual: bool,
    },
}
