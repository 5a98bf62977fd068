//! Timer engine: an owned in-memory job table plus a tick loop that
//! drains due jobs and spawns their execution.
//!
//! Two job kinds share the table:
//!
//! ```text
//! sched_<id>        schedule-start  reloaded from the schedule store on boot,
//!                                   re-registered after each recurring fire
//! timed_stop_<zone> derived-stop    armed by a successful start, unique per
//!                                   zone (replace-on-conflict), never persisted
//! ```
//!
//! Each firing runs in its own spawned task so a slow actuator call or a
//! failing job can never hold up other zones or the tick loop itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, error, info};

use crate::clock::SharedClock;
use crate::db::{Db, Schedule};
use crate::engine::{Engine, TransitionCause};

/// How often the timer engine checks for due jobs. Sub-second precision
/// is a non-goal.
const TICK_INTERVAL_SEC: u64 = 1;

// ---------------------------------------------------------------------------
// Job table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobId {
    /// Start job for a persisted schedule.
    Schedule(i64),
    /// Derived stop deadline for a zone.
    Stop(String),
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Schedule(id) => write!(f, "sched_{id}"),
            JobId::Stop(zone) => write!(f, "timed_stop_{zone}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimerJob {
    pub zone: String,
    pub fire_at: OffsetDateTime,
}

/// Shared, owned collection of pending timer jobs. All access goes
/// through insert/cancel/drain operations; there is no ambient global.
#[derive(Clone, Default)]
pub struct JobTable {
    inner: Arc<Mutex<HashMap<JobId, TimerJob>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. A conflicting id always yields the newest job.
    pub fn insert(&self, id: JobId, job: TimerJob) {
        self.inner.lock().unwrap().insert(id, job);
    }

    /// Arm (or re-arm) the single stop deadline for a zone.
    pub fn schedule_stop(&self, zone: &str, fire_at: OffsetDateTime) {
        self.insert(
            JobId::Stop(zone.to_string()),
            TimerJob {
                zone: zone.to_string(),
                fire_at,
            },
        );
    }

    /// Remove a job. Absence is not an error.
    pub fn cancel(&self, id: &JobId) -> Option<TimerJob> {
        self.inner.lock().unwrap().remove(id)
    }

    pub fn cancel_stop(&self, zone: &str) -> Option<TimerJob> {
        self.cancel(&JobId::Stop(zone.to_string()))
    }

    /// Drop every schedule-start job (stop deadlines stay armed).
    pub fn cancel_all_schedules(&self) {
        self.inner
            .lock()
            .unwrap()
            .retain(|id, _| !matches!(id, JobId::Schedule(_)));
    }

    pub fn get(&self, id: &JobId) -> Option<TimerJob> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Remove and return every job whose fire time has arrived.
    pub fn due(&self, now: OffsetDateTime) -> Vec<(JobId, TimerJob)> {
        let mut ripe = Vec::new();
        self.inner.lock().unwrap().retain(|id, job| {
            if job.fire_at <= now {
                ripe.push((id.clone(), job.clone()));
                false
            } else {
                true
            }
        });
        ripe
    }

    /// The next `limit` jobs, soonest first (health probe preview).
    pub fn upcoming(&self, limit: usize) -> Vec<(JobId, TimerJob)> {
        let table = self.inner.lock().unwrap();
        let mut jobs: Vec<(JobId, TimerJob)> = table
            .iter()
            .map(|(id, job)| (id.clone(), job.clone()))
            .collect();
        jobs.sort_by_key(|(_, job)| job.fire_at);
        jobs.truncate(limit);
        jobs
    }
}

// ---------------------------------------------------------------------------
// Recurrence math
// ---------------------------------------------------------------------------

/// Next fire instant for a schedule, strictly after `now`. One-shot
/// schedules in the past and recurrences beyond `end_date` (inclusive
/// cutoff) yield None.
pub fn next_fire(s: &Schedule, now: OffsetDateTime) -> Option<OffsetDateTime> {
    let mut next = PrimitiveDateTime::new(s.start_date, s.start_time).assume_utc();

    if s.interval_days > 0 {
        while next <= now {
            next += time::Duration::days(s.interval_days);
        }
    } else if next <= now {
        return None;
    }

    if let Some(end) = s.end_date {
        if next.date() > end {
            return None;
        }
    }

    Some(next)
}

/// Register (or replace) the start job for one schedule. Returns false
/// if the schedule has no future firing.
pub fn register_schedule(jobs: &JobTable, s: &Schedule, now: OffsetDateTime) -> bool {
    match next_fire(s, now) {
        Some(fire_at) => {
            jobs.insert(
                JobId::Schedule(s.id),
                TimerJob {
                    zone: s.zone.clone(),
                    fire_at,
                },
            );
            debug!(schedule = s.id, zone = %s.zone, %fire_at, "schedule registered");
            true
        }
        None => {
            debug!(schedule = s.id, zone = %s.zone, "schedule has no future firing, not registered");
            false
        }
    }
}

/// Startup protocol: register a start job for every persisted schedule.
/// Derived-stop jobs are transient by design and are not reconstructed
/// here; recovery handles zones they abandoned.
pub async fn load_schedules(db: &Db, jobs: &JobTable, clock: &SharedClock) -> Result<()> {
    let schedules = db.list_schedules().await?;
    let now = clock.now();

    let mut registered = 0usize;
    for s in &schedules {
        if register_schedule(jobs, s, now) {
            registered += 1;
        }
    }

    info!(
        total = schedules.len(),
        registered, "schedules loaded from store"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tick loop
// ---------------------------------------------------------------------------

/// Run the timer engine. Intended to be `tokio::spawn`-ed from main.
pub async fn run(engine: Arc<Engine>) {
    let jobs = engine.jobs().clone();
    let clock = engine.clock().clone();

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(TICK_INTERVAL_SEC));

    info!(tick_sec = TICK_INTERVAL_SEC, "scheduler started");

    loop {
        ticker.tick().await;
        let now = clock.now();

        for (id, job) in jobs.due(now) {
            match id {
                JobId::Schedule(schedule_id) => {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        fire_schedule(engine, schedule_id).await;
                    });
                }
                JobId::Stop(zone) => {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        debug!(zone = %job.zone, "stop deadline reached");
                        if let Err(e) = engine.stop_zone(&zone, TransitionCause::Deadline).await {
                            error!(zone = %zone, "timed stop failed: {e:#}");
                        }
                    });
                }
            }
        }
    }
}

/// Execute one schedule-start firing. The schedule row is reloaded by id
/// so deletions that raced the tick are honored, and the next recurrence
/// is re-registered before actuation: an abandoned (failed) start must
/// not cost the zone its following occurrence.
async fn fire_schedule(engine: Arc<Engine>, schedule_id: i64) {
    let schedule = match engine.db().get_schedule(schedule_id).await {
        Ok(Some(s)) => s,
        Ok(None) => {
            error!(schedule = schedule_id, "schedule not found, skipping fire");
            return;
        }
        Err(e) => {
            error!(schedule = schedule_id, "failed to load schedule: {e:#}");
            return;
        }
    };

    if schedule.interval_days > 0 {
        register_schedule(engine.jobs(), &schedule, engine.clock().now());
    }

    match engine
        .start_zone(
            &schedule.zone,
            schedule.duration_minutes,
            TransitionCause::Schedule,
        )
        .await
    {
        Ok(true) => {
            info!(
                schedule = schedule_id,
                zone = %schedule.zone,
                duration_minutes = schedule.duration_minutes,
                "schedule started zone"
            );
        }
        Ok(false) => {
            // Abandoned: no stop job, no state change, no retry within
            // this firing. The next recurrence stays registered.
            error!(
                schedule = schedule_id,
                zone = %schedule.zone,
                "schedule failed to start zone"
            );
        }
        Err(e) => {
            error!(
                schedule = schedule_id,
                zone = %schedule.zone,
                "schedule fire errored: {e:#}"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
