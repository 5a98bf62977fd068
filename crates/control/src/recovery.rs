//! Startup reconciliation. A zone persisted as `on` at boot means its
//! derived-stop job died with the previous process: either a legitimate
//! run interrupted by restart or a crash mid-run. Each such zone is
//! forced off through the actuator, and the truncated run is recorded
//! to history with the distinct forced-stop notification. Runs once,
//! before the scheduler starts firing.

use anyhow::Result;
use tracing::{info, warn};

use crate::engine::{Engine, TransitionCause};

pub async fn run(engine: &Engine) -> Result<()> {
    let stuck = engine.db().zones_stuck_on().await?;

    if stuck.is_empty() {
        info!("recovery: no zones left on");
        return Ok(());
    }

    let now = engine.clock().now().unix_timestamp();

    for status in stuck {
        let elapsed_min = status
            .activated_at
            .map(|start| (now - start).max(0) / 60)
            .unwrap_or(0);

        warn!(
            zone = %status.zone,
            elapsed_min,
            activated_at = ?status.activated_at,
            "recovery: zone left on, forcing stop"
        );

        if !engine.zones().contains(&status.zone) {
            // Config no longer knows this zone; nothing we can actuate.
            warn!(zone = %status.zone, "recovery: zone not in config, skipping");
            continue;
        }

        match engine.stop_zone(&status.zone, TransitionCause::Recovery).await {
            Ok(true) => {
                info!(zone = %status.zone, elapsed_min, "recovery: zone stopped and logged");
            }
            Ok(false) => {
                // Left on and unrecovered; the next restart or a manual
                // stop gets another chance.
                warn!(zone = %status.zone, "recovery: stop command failed, zone left on");
            }
            Err(e) => {
                warn!(zone = %status.zone, "recovery: {e:#}");
            }
        }
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::testserver::serve_status;
    use crate::actuator::ActuatorClient;
    use crate::clock::ManualClock;
    use crate::config::{ActuatorConfig, Config, Zones, ZoneEntry};
    use crate::db::{Db, ZoneState};
    use crate::notify::RecordingNotifier;
    use crate::scheduler::JobTable;
    use std::sync::Arc;
    use time::macros::datetime;
    use time::Duration;

    const BOOT: time::OffsetDateTime = datetime!(2026-06-01 06:45 UTC);

    async fn engine_with(stop_url: &str) -> (Engine, Arc<RecordingNotifier>, Db) {
        let config = Config {
            listen_addr: String::new(),
            db_url: String::new(),
            actuator: ActuatorConfig {
                timeout_secs: 2,
                max_attempts: 1,
                backoff_start_ms: 1,
                backoff_multiplier: 1.5,
            },
            pushover: None,
            zones: vec![ZoneEntry {
                zone_id: "lawn".into(),
                label: "Lawn".into(),
                start_url: "http://unused/".into(),
                stop_url: stop_url.into(),
            }],
        };
        let zones = Arc::new(Zones::from_config(&config));

        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        crate::config::apply(&config, &db).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::new());
        let engine = Engine::new(
            db.clone(),
            zones,
            ActuatorClient::new(&config.actuator).unwrap(),
            notifier.clone(),
            Arc::new(ManualClock::new(BOOT)),
            JobTable::new(),
        );

        (engine, notifier, db)
    }

    #[tokio::test]
    async fn stuck_zone_is_forced_off_and_logged() {
        let (url, _) = serve_status(200).await;
        let (engine, notifier, db) = engine_with(&url).await;

        // Left on 45 minutes before boot.
        let started = (BOOT - Duration::minutes(45)).unix_timestamp();
        db.set_zone_on("lawn", started).await.unwrap();

        run(&engine).await.unwrap();

        let st = db.zone_status("lawn").await.unwrap().unwrap();
        assert_eq!(st.state, ZoneState::Off);
        assert_eq!(st.activated_at, None);

        let history = db.list_history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].start_ts, started);
        assert_eq!(history[0].duration_minutes, 45);

        // Exactly one notification, with the forced-stop wording.
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(
            messages[0].contains("force-stopped"),
            "got: {}",
            messages[0]
        );
        assert!(messages[0].contains("45 minutes"), "got: {}", messages[0]);
    }

    #[tokio::test]
    async fn failed_stop_leaves_zone_unrecovered() {
        let (url, _) = serve_status(500).await;
        let (engine, notifier, db) = engine_with(&url).await;

        let started = (BOOT - Duration::minutes(10)).unix_timestamp();
        db.set_zone_on("lawn", started).await.unwrap();

        run(&engine).await.unwrap();

        let st = db.zone_status("lawn").await.unwrap().unwrap();
        assert_eq!(st.state, ZoneState::On);
        assert_eq!(st.activated_at, Some(started));
        assert!(db.list_history().await.unwrap().is_empty());
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn nothing_stuck_is_a_noop() {
        let (engine, notifier, db) = engine_with("http://unused/").await;

        run(&engine).await.unwrap();

        assert!(db.list_history().await.unwrap().is_empty());
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_zone_is_skipped() {
        let (url, hits) = serve_status(200).await;
        let (engine, _notifier, db) = engine_with(&url).await;

        // A row from a zone that has since been removed from the config.
        db.seed_zone("orchard").await.unwrap();
        db.set_zone_on("orchard", BOOT.unix_timestamp() - 600).await.unwrap();

        run(&engine).await.unwrap();

        // Untouched: still on, no actuator call made for it.
        let st = db.zone_status("orchard").await.unwrap().unwrap();
        assert_eq!(st.state, ZoneState::On);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
