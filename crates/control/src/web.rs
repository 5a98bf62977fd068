//! HTTP API: actuator status reports, manual zone control, schedule and
//! history management, and the health probe. Input validation lives
//! here: malformed schedules and unknown zones are rejected at this
//! boundary and never reach the scheduler.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::{self, ZoneState};
use crate::engine::{Engine, TransitionCause};
use crate::scheduler::{self, JobId};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub enum ApiError {
    /// Malformed input: rejected before any state is touched.
    BadRequest(String),
    /// The actuator refused or never answered a direct command.
    Actuator(String),
    /// Store or other internal failure.
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Actuator(m) => (StatusCode::BAD_GATEWAY, m),
            ApiError::Internal(e) => {
                error!("api internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal".to_string())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(list_status))
        .route("/api/history", get(list_history))
        .route("/api/schedules", get(list_schedules))
        .route("/api/schedule", post(create_schedule))
        .route("/api/report_status/{zone}/{state}", get(report_status))
        .route("/api/zones/{zone}/start", post(start_zone))
        .route("/api/zones/{zone}/stop", post(stop_zone))
        .route("/api/delete/{table}/{id}", post(delete_item))
        .route("/api/clear/{table}", post(clear_table))
        .with_state(state)
}

fn require_zone(app: &AppState, zone: &str) -> Result<(), ApiError> {
    if app.engine.zones().contains(zone) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("unknown zone '{zone}'")))
    }
}

// ---------------------------------------------------------------------------
// Status reports + manual control
// ---------------------------------------------------------------------------

/// External push from the actuator reporting a zone's physical state.
async fn report_status(
    State(app): State<AppState>,
    Path((zone, state)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    require_zone(&app, &zone)?;
    let Some(new_state) = ZoneState::parse(&state) else {
        return Err(ApiError::BadRequest(format!(
            "invalid state '{state}' (expected on/off)"
        )));
    };

    info!(zone = %zone, state = %new_state, "status report received");
    app.engine
        .transition(&zone, new_state, TransitionCause::Report)
        .await?;

    Ok(Json(json!({ "status": "reported" })))
}

#[derive(Deserialize)]
struct StartRequest {
    #[serde(default = "default_duration")]
    duration_minutes: i64,
}

fn default_duration() -> i64 {
    30
}

async fn start_zone(
    State(app): State<AppState>,
    Path(zone): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<Value>, ApiError> {
    require_zone(&app, &zone)?;
    let duration_minutes = body.map(|Json(b)| b.duration_minutes).unwrap_or_else(default_duration);
    if duration_minutes < 0 {
        return Err(ApiError::BadRequest(
            "duration_minutes must be >= 0".to_string(),
        ));
    }

    let started = app
        .engine
        .start_zone(&zone, duration_minutes, TransitionCause::Manual)
        .await?;
    if !started {
        return Err(ApiError::Actuator(format!("failed to start zone '{zone}'")));
    }

    Ok(Json(json!({
        "status": "started",
        "zone": zone,
        "duration_minutes": duration_minutes,
    })))
}

async fn stop_zone(
    State(app): State<AppState>,
    Path(zone): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_zone(&app, &zone)?;

    let stopped = app.engine.stop_zone(&zone, TransitionCause::Manual).await?;
    if !stopped {
        return Err(ApiError::Actuator(format!("failed to stop zone '{zone}'")));
    }

    Ok(Json(json!({ "status": "stopped", "zone": zone })))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateSchedule {
    zone: String,
    start_date: String,
    start_time: String,
    #[serde(default)]
    duration_minutes: i64,
    #[serde(default)]
    interval_days: i64,
    end_date: Option<String>,
}

async fn create_schedule(
    State(app): State<AppState>,
    Json(req): Json<CreateSchedule>,
) -> Result<Json<Value>, ApiError> {
    require_zone(&app, &req.zone)?;

    let start_date =
        db::parse_date(&req.start_date).map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    let start_time =
        db::parse_time(&req.start_time).map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    let end_date = req
        .end_date
        .as_deref()
        .map(db::parse_date)
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;

    if req.duration_minutes < 0 {
        return Err(ApiError::BadRequest(
            "duration_minutes must be >= 0".to_string(),
        ));
    }
    if req.interval_days < 0 {
        return Err(ApiError::BadRequest(
            "interval_days must be >= 0".to_string(),
        ));
    }

    let schedule = app
        .engine
        .db()
        .insert_schedule(&crate::db::NewSchedule {
            zone: req.zone,
            start_date,
            start_time,
            duration_minutes: req.duration_minutes,
            interval_days: req.interval_days,
            end_date,
        })
        .await?;

    // Registered immediately; past one-shots simply never fire.
    scheduler::register_schedule(app.engine.jobs(), &schedule, app.engine.clock().now());
    info!(schedule = schedule.id, zone = %schedule.zone, "schedule created");

    Ok(Json(json!({ "status": "created", "id": schedule.id })))
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusView {
    zone: String,
    label: String,
    state: String,
    activated_at: Option<String>,
}

async fn list_status(State(app): State<AppState>) -> Result<Json<Vec<StatusView>>, ApiError> {
    let statuses = app.engine.db().all_statuses().await?;
    let views = statuses
        .into_iter()
        .map(|s| StatusView {
            label: app
                .engine
                .zones()
                .get(&s.zone)
                .map(|z| z.label.clone())
                .unwrap_or_else(|| s.zone.clone()),
            zone: s.zone,
            state: s.state.to_string(),
            activated_at: s.activated_at.map(db::format_ts),
        })
        .collect();
    Ok(Json(views))
}

#[derive(Serialize)]
struct HistoryView {
    id: i64,
    zone: String,
    start_ts: String,
    duration_minutes: i64,
}

async fn list_history(State(app): State<AppState>) -> Result<Json<Vec<HistoryView>>, ApiError> {
    let entries = app.engine.db().list_history().await?;
    let views = entries
        .into_iter()
        .map(|h| HistoryView {
            id: h.id,
            zone: h.zone,
            start_ts: db::format_ts(h.start_ts),
            duration_minutes: h.duration_minutes,
        })
        .collect();
    Ok(Json(views))
}

#[derive(Serialize)]
struct ScheduleView {
    id: i64,
    zone: String,
    start_date: String,
    start_time: String,
    duration_minutes: i64,
    interval_days: i64,
    end_date: Option<String>,
    /// Computed next fire instant; null once expired.
    next_fire: Option<String>,
}

async fn list_schedules(State(app): State<AppState>) -> Result<Json<Vec<ScheduleView>>, ApiError> {
    let now = app.engine.clock().now();
    let schedules = app.engine.db().list_schedules().await?;
    let views = schedules
        .into_iter()
        .map(|s| ScheduleView {
            next_fire: scheduler::next_fire(&s, now).map(|t| db::format_ts(t.unix_timestamp())),
            id: s.id,
            zone: s.zone,
            start_date: db::format_date(s.start_date),
            start_time: db::format_time(s.start_time),
            duration_minutes: s.duration_minutes,
            interval_days: s.interval_days,
            end_date: s.end_date.map(db::format_date),
        })
        .collect();
    Ok(Json(views))
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

async fn delete_item(
    State(app): State<AppState>,
    Path((table, id)): Path<(String, i64)>,
) -> Result<Json<Value>, ApiError> {
    match table.as_str() {
        "schedules" => {
            // Cancel the timer first; its absence is not an error.
            app.engine.jobs().cancel(&JobId::Schedule(id));
            app.engine.db().delete_schedule(id).await?;
        }
        "history" => app.engine.db().delete_history(id).await?,
        _ => return Err(ApiError::BadRequest(format!("invalid table '{table}'"))),
    }
    Ok(Json(json!({ "status": "deleted", "id": id })))
}

async fn clear_table(
    State(app): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match table.as_str() {
        "schedules" => {
            app.engine.jobs().cancel_all_schedules();
            app.engine.db().clear_schedules().await?;
        }
        "history" => app.engine.db().clear_history().await?,
        _ => return Err(ApiError::BadRequest(format!("invalid table '{table}'"))),
    }
    Ok(Json(json!({ "status": "cleared" })))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(app): State<AppState>) -> Response {
    if let Err(e) = app.engine.db().ping().await {
        error!("health probe: {e:#}");
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "ok": false }))).into_response();
    }

    let jobs = app.engine.jobs();
    let next_runs: Vec<Value> = jobs
        .upcoming(10)
        .into_iter()
        .map(|(id, job)| {
            json!({
                "id": id.to_string(),
                "fire_at": db::format_ts(job.fire_at.unix_timestamp()),
            })
        })
        .collect();

    Json(json!({
        "ok": true,
        "version": VERSION,
        "jobs_count": jobs.len(),
        "next_runs": next_runs,
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(listen_addr: &str, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;

    info!("api listening on http://{listen_addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
