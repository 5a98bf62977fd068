//! Zone lifecycle engine: the single state-transition entry point plus
//! the start/stop operations built on it. Every path that changes a
//! zone's persisted state (actuator status reports, manual API calls,
//! schedule firings, stop deadlines, and startup recovery) funnels
//! through [`Engine::transition`], which serializes per zone so
//! duplicate or racing events collapse into at most one authoritative
//! transition.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::actuator::ActuatorClient;
use crate::clock::SharedClock;
use crate::config::Zones;
use crate::db::{Db, ZoneState};
use crate::notify::SharedNotifier;
use crate::scheduler::JobTable;

/// What prompted a transition. Never changes state semantics, only the
/// notification wording and log detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// External push from the actuator reporting its physical state.
    Report,
    /// Direct API call.
    Manual,
    /// A schedule-start job fired.
    Schedule,
    /// A derived-stop job reached its deadline.
    Deadline,
    /// Startup recovery of a zone left on.
    Recovery,
}

pub struct Engine {
    db: Db,
    zones: Arc<Zones>,
    actuator: ActuatorClient,
    notifier: SharedNotifier,
    clock: SharedClock,
    jobs: JobTable,
    /// One mutex per configured zone; held across the read-modify-write
    /// in `transition` so same-zone events are serialized while
    /// different zones proceed concurrently.
    locks: HashMap<String, Mutex<()>>,
}

impl Engine {
    pub fn new(
        db: Db,
        zones: Arc<Zones>,
        actuator: ActuatorClient,
        notifier: SharedNotifier,
        clock: SharedClock,
        jobs: JobTable,
    ) -> Self {
        let locks = zones
            .ids()
            .map(|z| (z.to_string(), Mutex::new(())))
            .collect();
        Self {
            db,
            zones,
            actuator,
            notifier,
            clock,
            jobs,
            locks,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    pub fn zones(&self) -> &Zones {
        &self.zones
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // -----------------------------------------------------------------
    // State transition
    // -----------------------------------------------------------------

    /// Apply a state change for one zone. Idempotent: if the persisted
    /// state already matches, nothing is written and nothing is
    /// notified. Turning off computes the elapsed duration and appends
    /// the run to history.
    pub async fn transition(
        &self,
        zone: &str,
        new_state: ZoneState,
        cause: TransitionCause,
    ) -> Result<()> {
        let lock = self
            .locks
            .get(zone)
            .with_context(|| format!("unknown zone '{zone}'"))?;
        let _guard = lock.lock().await;

        let current = self
            .db
            .zone_status(zone)
            .await?
            .with_context(|| format!("no status row for zone '{zone}'"))?;

        if current.state == new_state {
            info!(zone, state = %new_state, ?cause, "state already {new_state}, ignoring");
            return Ok(());
        }

        let label = self
            .zones
            .get(zone)
            .map(|z| z.label.clone())
            .unwrap_or_else(|| zone.to_string());
        let now = self.clock.now().unix_timestamp();

        match new_state {
            ZoneState::On => {
                self.db.set_zone_on(zone, now).await?;
                info!(zone, ?cause, "zone started");
                self.notifier
                    .notify(format!("💧 Irrigation for {label} started."));
            }
            ZoneState::Off => {
                let duration = current
                    .activated_at
                    .map(|start| round_minutes(now - start))
                    .unwrap_or(0);

                // A run with no recorded start has nothing to log.
                if let Some(start_ts) = current.activated_at {
                    self.db.insert_history(zone, start_ts, duration).await?;
                }
                self.db.set_zone_off(zone).await?;
                info!(zone, duration, ?cause, "zone stopped");

                let message = if cause == TransitionCause::Recovery {
                    format!(
                        "⚠️ Irrigation for {label} was force-stopped at startup after {duration} minutes."
                    )
                } else {
                    format!("✅ Irrigation for {label} finished after {duration} minutes.")
                };
                self.notifier.notify(message);
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------
    // Start / stop operations
    // -----------------------------------------------------------------

    /// Actuate a zone on and arm its stop deadline. Returns false (with
    /// no state change and no stop job) if the actuator command failed.
    /// Any pending stop job for the zone is replaced, so a fresh start
    /// always owns the single authoritative stop timer.
    pub async fn start_zone(
        &self,
        zone: &str,
        duration_minutes: i64,
        cause: TransitionCause,
    ) -> Result<bool> {
        let target = self
            .zones
            .get(zone)
            .with_context(|| format!("unknown zone '{zone}'"))?;

        if !self.actuator.send(&target.start_url).await {
            warn!(zone, ?cause, "start command failed, activation abandoned");
            return Ok(false);
        }

        self.transition(zone, ZoneState::On, cause).await?;

        let stop_at = self.clock.now() + Duration::minutes(duration_minutes);
        self.jobs.schedule_stop(zone, stop_at);
        info!(zone, duration_minutes, ?cause, "stop deadline armed");

        Ok(true)
    }

    /// Actuate a zone off. The pending stop job is cancelled up front;
    /// if the actuator command then fails the zone stays logically on
    /// (retried manually or picked up by the next restart's recovery).
    pub async fn stop_zone(&self, zone: &str, cause: TransitionCause) -> Result<bool> {
        let target = self
            .zones
            .get(zone)
            .with_context(|| format!("unknown zone '{zone}'"))?;

        // A deadline firing's own job was already drained by the tick
        // loop; cancelling here could remove a stop job a racing fresh
        // start just armed.
        if cause != TransitionCause::Deadline {
            self.jobs.cancel_stop(zone);
        }

        if !self.actuator.send(&target.stop_url).await {
            warn!(zone, ?cause, "stop command failed, zone left on");
            return Ok(false);
        }

        self.transition(zone, ZoneState::Off, cause).await?;
        Ok(true)
    }
}

/// Elapsed seconds rounded to whole minutes, clamped at zero.
fn round_minutes(seconds: i64) -> i64 {
    ((seconds as f64 / 60.0).round() as i64).max(0)
}

// ===========================================================================
// Tests
// ===========================================================================
