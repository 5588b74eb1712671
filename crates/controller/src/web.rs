//! Dashboard-facing HTTP surface: the scheduler entry points plus alert
//! management, JSON over axum.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::info;

use crate::alerts::{self, AlertStats};
use crate::db::{now_unix, Alert, Db, Zone};
use crate::scheduler::{
    ActiveIrrigation, PendingIrrigation, Recurrence, ScheduleError, Scheduler,
};

const INDEX_HTML: &str = include_str!("ui/index.html");

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/schedules", get(api_list_schedules).post(api_create_schedule))
        .route("/api/schedules/{id}", delete(api_cancel_schedule))
        .route("/api/schedules/{id}/stop", post(api_stop_schedule))
        .route("/api/irrigations/active", get(api_active_irrigations))
        .route("/api/alerts", get(api_list_alerts))
        .route("/api/alerts/stats", get(api_alert_stats))
        .route("/api/alerts/{id}/dismiss", post(api_dismiss_alert))
        .route("/api/alerts/{id}/resolve", post(api_resolve_alert))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    zones: Vec<Zone>,
    control_active: bool,
    active_irrigations: Vec<ActiveIrrigation>,
    pending_schedules: Vec<PendingIrrigation>,
    alerts: AlertStats,
}

async fn api_status(State(st): State<AppState>) -> Response {
    let zones = match st.db.load_zones().await {
        Ok(z) => z,
        Err(e) => return internal(e),
    };
    let control_active = match st.db.control_active().await {
        Ok(c) => c,
        Err(e) => return internal(e),
    };
    let open = match st.db.open_alerts().await {
        Ok(a) => a,
        Err(e) => return internal(e),
    };
    Json(StatusResponse {
        zones,
        control_active,
        active_irrigations: st.scheduler.active_irrigations(),
        pending_schedules: st.scheduler.scheduled_irrigations(),
        alerts: alerts::stats(&open),
    })
    .into_response()
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateSchedule {
    zone_id: i64,
    /// RFC 3339, e.g. "2026-08-24T06:30:00Z".
    start_time: String,
    duration_min: i64,
    /// Optional recurrence; expands into one schedule row per occurrence.
    repeat: Option<Recurrence>,
    /// RFC 3339 end of the series; defaults to December 31 of the year
    /// after the start.
    repeat_until: Option<String>,
}

async fn api_create_schedule(
    State(st): State<AppState>,
    Json(req): Json<CreateSchedule>,
) -> Response {
    let when = match OffsetDateTime::parse(&req.start_time, &Rfc3339) {
        Ok(t) => t.unix_timestamp(),
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid start_time: {e}")).into_response()
        }
    };
    let until = match &req.repeat_until {
        Some(raw) => match OffsetDateTime::parse(raw, &Rfc3339) {
            Ok(t) => Some(t.unix_timestamp()),
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("invalid repeat_until: {e}"))
                    .into_response()
            }
        },
        None => None,
    };

    match req.repeat {
        Some(recurrence) => match st
            .scheduler
            .schedule_recurring(req.zone_id, when, req.duration_min, recurrence, until)
            .await
        {
            Ok(entries) => (StatusCode::CREATED, Json(entries)).into_response(),
            Err(e) => schedule_error(e),
        },
        None => match st
            .scheduler
            .schedule_irrigation(req.zone_id, when, req.duration_min)
            .await
        {
            Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
            Err(e) => schedule_error(e),
        },
    }
}

fn schedule_error(e: ScheduleError) -> Response {
    match e {
        ScheduleError::Store(e) => internal(e),
        e => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn api_list_schedules(State(st): State<AppState>) -> Json<Vec<PendingIrrigation>> {
    Json(st.scheduler.scheduled_irrigations())
}

/// Drops the armed timer and deletes the backing row.
async fn api_cancel_schedule(State(st): State<AppState>, Path(id): Path<i64>) -> Response {
    let had_timer = st.scheduler.cancel_schedule(id);
    match st.db.delete_schedule(id).await {
        Ok(deleted) if deleted || had_timer => StatusCode::NO_CONTENT.into_response(),
        Ok(_) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal(e),
    }
}

async fn api_stop_schedule(State(st): State<AppState>, Path(id): Path<i64>) -> Response {
    match st.scheduler.stop_manually(id).await {
        Ok(true) => Json(serde_json::json!({ "stopped": true })).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn api_active_irrigations(State(st): State<AppState>) -> Json<Vec<ActiveIrrigation>> {
    Json(st.scheduler.active_irrigations())
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

async fn api_list_alerts(State(st): State<AppState>) -> Response {
    match st.db.open_alerts().await {
        Ok(open) => Json::<Vec<Alert>>(open).into_response(),
        Err(e) => internal(e),
    }
}

async fn api_alert_stats(State(st): State<AppState>) -> Response {
    match st.db.open_alerts().await {
        Ok(open) => Json(alerts::stats(&open)).into_response(),
        Err(e) => internal(e),
    }
}

async fn api_dismiss_alert(State(st): State<AppState>, Path(id): Path<i64>) -> Response {
    match st.db.dismiss_alert(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal(e),
    }
}

async fn api_resolve_alert(State(st): State<AppState>, Path(id): Path<i64>) -> Response {
    match st.db.resolve_alert(id, now_unix()).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal(e),
    }
}

fn internal(e: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind web port");

    info!("dashboard listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================
