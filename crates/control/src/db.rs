//! SQLite persistence: zone status (single source of truth for "is this
//! zone running and since when"), schedule definitions, and the
//! append-only history ledger.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::fmt;
use std::str::FromStr;
use time::macros::format_description;
use time::{Date, OffsetDateTime, Time};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Persisted vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    On,
    Off,
}

impl ZoneState {
    pub fn as_str(self) -> &'static str {
        match self {
            ZoneState::On => "on",
            ZoneState::Off => "off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(ZoneState::On),
            "off" => Some(ZoneState::Off),
            _ => None,
        }
    }
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per known zone; `activated_at` (unix seconds) is present iff
/// the zone is on.
#[derive(Debug, Clone)]
pub struct ZoneStatus {
    pub zone: String,
    pub state: ZoneState,
    pub activated_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: i64,
    pub zone: String,
    pub start_date: Date,
    pub start_time: Time,
    pub duration_minutes: i64,
    pub interval_days: i64,
    pub end_date: Option<Date>,
}

/// A schedule as accepted at the creation boundary, before it has an id.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub zone: String,
    pub start_date: Date,
    pub start_time: Time,
    pub duration_minutes: i64,
    pub interval_days: i64,
    pub end_date: Option<Date>,
}

/// Immutable record of a completed (or recovered) activation.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub zone: String,
    pub start_ts: i64,
    pub duration_minutes: i64,
}

// ---------------------------------------------------------------------------
// Date / time text forms
// ---------------------------------------------------------------------------

pub fn parse_date(s: &str) -> Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("invalid date '{s}' (expected YYYY-MM-DD)"))
}

pub fn parse_time(s: &str) -> Result<Time> {
    Time::parse(s, format_description!("[hour]:[minute]"))
        .with_context(|| format!("invalid time '{s}' (expected HH:MM)"))
}

pub fn format_date(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

pub fn format_time(t: Time) -> String {
    format!("{:02}:{:02}", t.hour(), t.minute())
}

/// Render a unix-seconds timestamp as "YYYY-MM-DD HH:MM:SS" for API
/// responses and notifications.
pub fn format_ts(ts: i64) -> String {
    match OffsetDateTime::from_unix_timestamp(ts) {
        Ok(dt) => format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            dt.year(),
            dt.month() as u8,
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        ),
        Err(_) => ts.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:irrigation.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("db ping failed")?;
        Ok(())
    }

    // ----------------------------
    // Zone status
    // ----------------------------

    /// Create the status row for a zone if it does not exist yet.
    pub async fn seed_zone(&self, zone: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO status (zone, state) VALUES (?, 'off')")
            .bind(zone)
            .execute(&self.pool)
            .await
            .context("seed_zone failed")?;
        Ok(())
    }

    pub async fn zone_status(&self, zone: &str) -> Result<Option<ZoneStatus>> {
        let row = sqlx::query("SELECT zone, state, activated_at FROM status WHERE zone = ?")
            .bind(zone)
            .fetch_optional(&self.pool)
            .await
            .context("zone_status failed")?;

        row.map(status_from_row).transpose()
    }

    pub async fn all_statuses(&self) -> Result<Vec<ZoneStatus>> {
        let rows = sqlx::query("SELECT zone, state, activated_at FROM status ORDER BY zone")
            .fetch_all(&self.pool)
            .await
            .context("all_statuses failed")?;

        rows.into_iter().map(status_from_row).collect()
    }

    /// Zones persisted as `on`, candidates for startup recovery.
    pub async fn zones_stuck_on(&self) -> Result<Vec<ZoneStatus>> {
        let rows = sqlx::query(
            "SELECT zone, state, activated_at FROM status WHERE state = 'on' ORDER BY zone",
        )
        .fetch_all(&self.pool)
        .await
        .context("zones_stuck_on failed")?;

        rows.into_iter().map(status_from_row).collect()
    }

    pub async fn set_zone_on(&self, zone: &str, activated_at: i64) -> Result<()> {
        sqlx::query("UPDATE status SET state = 'on', activated_at = ? WHERE zone = ?")
            .bind(activated_at)
            .bind(zone)
            .execute(&self.pool)
            .await
            .context("set_zone_on failed")?;
        Ok(())
    }

    pub async fn set_zone_off(&self, zone: &str) -> Result<()> {
        sqlx::query("UPDATE status SET state = 'off', activated_at = NULL WHERE zone = ?")
            .bind(zone)
            .execute(&self.pool)
            .await
            .context("set_zone_off failed")?;
        Ok(())
    }

    // ----------------------------
    // History ledger (append-only)
    // ----------------------------

    pub async fn insert_history(&self, zone: &str, start_ts: i64, duration_minutes: i64) -> Result<()> {
        sqlx::query("INSERT INTO history (zone, start_ts, duration_minutes) VALUES (?, ?, ?)")
            .bind(zone)
            .bind(start_ts)
            .bind(duration_minutes)
            .execute(&self.pool)
            .await
            .context("insert_history failed")?;
        Ok(())
    }

    pub async fn list_history(&self) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, zone, start_ts, duration_minutes FROM history ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_history failed")?;

        rows.into_iter()
            .map(|r| {
                Ok(HistoryEntry {
                    id: r.try_get("id")?,
                    zone: r.try_get("zone")?,
                    start_ts: r.try_get("start_ts")?,
                    duration_minutes: r.try_get("duration_minutes")?,
                })
            })
            .collect()
    }

    pub async fn delete_history(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_history failed")?;
        Ok(())
    }

    pub async fn clear_history(&self) -> Result<()> {
        sqlx::query("DELETE FROM history")
            .execute(&self.pool)
            .await
            .context("clear_history failed")?;
        Ok(())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn insert_schedule(&self, s: &NewSchedule) -> Result<Schedule> {
        let result = sqlx::query(
            r#"
            INSERT INTO schedules (zone, start_date, start_time, duration_minutes, interval_days, end_date)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&s.zone)
        .bind(format_date(s.start_date))
        .bind(format_time(s.start_time))
        .bind(s.duration_minutes)
        .bind(s.interval_days)
        .bind(s.end_date.map(format_date))
        .execute(&self.pool)
        .await
        .context("insert_schedule failed")?;

        Ok(Schedule {
            id: result.last_insert_rowid(),
            zone: s.zone.clone(),
            start_date: s.start_date,
            start_time: s.start_time,
            duration_minutes: s.duration_minutes,
            interval_days: s.interval_days,
            end_date: s.end_date,
        })
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>> {
        let row = sqlx::query(
            r#"
            SELECT id, zone, start_date, start_time, duration_minutes, interval_days, end_date
            FROM schedules
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_schedule failed")?;

        row.map(schedule_from_row).transpose()
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, zone, start_date, start_time, duration_minutes, interval_days, end_date
            FROM schedules
            ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("list_schedules failed")?;

        rows.into_iter().map(schedule_from_row).collect()
    }

    pub async fn delete_schedule(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_schedule failed")?;
        Ok(())
    }

    pub async fn clear_schedules(&self) -> Result<()> {
        sqlx::query("DELETE FROM schedules")
            .execute(&self.pool)
            .await
            .context("clear_schedules failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn status_from_row(r: SqliteRow) -> Result<ZoneStatus> {
    let zone: String = r.try_get("zone")?;
    let state_text: String = r.try_get("state")?;
    let Some(state) = ZoneState::parse(&state_text) else {
        bail!("status row for '{zone}' has unknown state '{state_text}'");
    };
    Ok(ZoneStatus {
        zone,
        state,
        activated_at: r.try_get("activated_at")?,
    })
}

fn schedule_from_row(r: SqliteRow) -> Result<Schedule> {
    let id: i64 = r.try_get("id")?;
    let start_date: String = r.try_get("start_date")?;
    let start_time: String = r.try_get("start_time")?;
    let end_date: Option<String> = r.try_get("end_date")?;

    Ok(Schedule {
        id,
        zone: r.try_get("zone")?,
        start_date: parse_date(&start_date)
            .with_context(|| format!("schedule {id} has malformed start_date"))?,
        start_time: parse_time(&start_time)
            .with_context(|| format!("schedule {id} has malformed start_time"))?,
        duration_minutes: r.try_get("duration_minutes")?,
        interval_days: r.try_get("interval_days")?,
        end_date: end_date
            .map(|d| parse_date(&d).with_context(|| format!("schedule {id} has malformed end_date")))
            .transpose()?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
