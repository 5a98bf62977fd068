mod actuator;
mod clock;
mod config;
mod db;
mod engine;
mod notify;
mod recovery;
mod scheduler;
mod web;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::actuator::ActuatorClient;
use crate::clock::{SharedClock, SystemClock};
use crate::config::Zones;
use crate::db::Db;
use crate::engine::Engine;
use crate::notify::{LogNotifier, PushoverNotifier, SharedNotifier};
use crate::scheduler::JobTable;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = config::load(&config_path)?;
    info!(
        config = %config_path,
        zones = config.zones.len(),
        "irrigation control starting"
    );

    let db = Db::connect(&config.db_url).await?;
    db.migrate().await?;
    config::apply(&config, &db).await?;

    let zones = Arc::new(Zones::from_config(&config));
    let actuator = ActuatorClient::new(&config.actuator)?;
    let notifier: SharedNotifier = match &config.pushover {
        Some(p) => Arc::new(PushoverNotifier::new(p)?),
        None => {
            info!("no pushover credentials, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };
    let clock: SharedClock = Arc::new(SystemClock);

    let engine = Arc::new(Engine::new(
        db.clone(),
        zones,
        actuator,
        notifier,
        clock,
        JobTable::new(),
    ));

    // Boot order matters: zones left on by the previous process are
    // reconciled before any timer can fire against them.
    recovery::run(&engine).await?;
    scheduler::load_schedules(&db, engine.jobs(), engine.clock()).await?;

    tokio::spawn(scheduler::run(Arc::clone(&engine)));

    web::serve(&config.listen_addr, AppState { engine }).await
}
