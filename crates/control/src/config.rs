//! TOML config file loading, validation, and database seeding for the
//! fixed zone set.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::db::Db;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_db_url")]
    pub db_url: String,
    #[serde(default)]
    pub actuator: ActuatorConfig,
    pub pushover: Option<PushoverConfig>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub label: String,
    pub start_url: String,
    pub stop_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ActuatorConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_start_ms")]
    pub backoff_start_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Debug, Deserialize)]
pub struct PushoverConfig {
    pub token: String,
    pub user: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:5080".to_string()
}

fn default_db_url() -> String {
    "sqlite:irrigation.db?mode=rwc".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_start_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_start_ms: default_backoff_start_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl ActuatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_start(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }
}

// ---------------------------------------------------------------------------
// Zone registry
// ---------------------------------------------------------------------------

/// The fixed set of controllable zones. Built once from the validated
/// config; zones are never created or destroyed at runtime.
#[derive(Debug)]
pub struct Zones {
    inner: HashMap<String, ZoneInfo>,
}

#[derive(Debug, Clone)]
pub struct ZoneInfo {
    pub zone_id: String,
    pub label: String,
    pub start_url: String,
    pub stop_url: String,
}

impl Zones {
    pub fn from_config(config: &Config) -> Self {
        let inner = config
            .zones
            .iter()
            .map(|z| {
                (
                    z.zone_id.clone(),
                    ZoneInfo {
                        zone_id: z.zone_id.clone(),
                        label: z.label.clone(),
                        start_url: z.start_url.clone(),
                        stop_url: z.stop_url.clone(),
                    },
                )
            })
            .collect();
        Self { inner }
    }

    pub fn get(&self, zone_id: &str) -> Option<&ZoneInfo> {
        self.inner.get(zone_id)
    }

    pub fn contains(&self, zone_id: &str) -> bool {
        self.inner.contains_key(zone_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_zones(&mut errors);
        self.validate_actuator(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        if self.zones.is_empty() {
            errors.push("no zones defined".to_string());
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.zone_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.zone_id)
                }
            };

            if z.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }

            if z.label.trim().is_empty() {
                errors.push(format!("{}: label is empty", ctx()));
            }

            for (field, url) in [("start_url", &z.start_url), ("stop_url", &z.stop_url)] {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    errors.push(format!("{}: {field} '{url}' is not an http(s) URL", ctx()));
                }
            }
        }
    }

    fn validate_actuator(&self, errors: &mut Vec<String>) {
        let a = &self.actuator;
        if a.timeout_secs == 0 {
            errors.push("actuator: timeout_secs must be positive".to_string());
        }
        if a.max_attempts == 0 {
            errors.push("actuator: max_attempts must be at least 1".to_string());
        }
        if a.backoff_multiplier < 1.0 {
            errors.push(format!(
                "actuator: backoff_multiplier must be >= 1.0, got {}",
                a.backoff_multiplier
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed a status row (state `off`) for every configured zone. Existing
/// rows are left untouched so in-progress state survives restarts.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for z in &config.zones {
        db.seed_zone(&z.zone_id)
            .await
            .with_context(|| format!("failed to seed zone '{}'", z.zone_id))?;
    }

    tracing::info!(zones = config.zones.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_zone() -> ZoneEntry {
        ZoneEntry {
            zone_id: "lawn".into(),
            label: "Lawn".into(),
            start_url: "http://192.168.1.201:49792/grass1".into(),
            stop_url: "http://192.168.1.201:49792/grass0".into(),
        }
    }

    fn valid_config() -> Config {
        Config {
            listen_addr: default_listen_addr(),
            db_url: default_db_url(),
            actuator: ActuatorConfig::default(),
            pushover: None,
            zones: vec![valid_zone()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
[[zones]]
zone_id = "lawn"
label = "Lawn"
start_url = "http://192.168.1.201:49792/grass1"
stop_url = "http://192.168.1.201:49792/grass0"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.zones[0].zone_id, "lawn");
        // Defaults fill in everything else.
        assert_eq!(config.listen_addr, "0.0.0.0:5080");
        assert_eq!(config.actuator.max_attempts, 3);
        assert_eq!(config.actuator.timeout_secs, 5);
        assert!(config.pushover.is_none());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
listen_addr = "127.0.0.1:8080"
db_url = "sqlite::memory:"

[actuator]
timeout_secs = 2
max_attempts = 5
backoff_start_ms = 100
backoff_multiplier = 2.0

[pushover]
token = "t"
user = "u"

[[zones]]
zone_id = "trees"
label = "Trees"
start_url = "http://10.0.0.1/trees1"
stop_url = "http://10.0.0.1/trees0"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.actuator.max_attempts, 5);
        assert_eq!(config.pushover.as_ref().unwrap().token, "t");
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn empty_zone_set_rejected() {
        let mut cfg = valid_config();
        cfg.zones.clear();
        assert_validation_err(&cfg, "no zones defined");
    }

    #[test]
    fn zone_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].zone_id = "".into();
        assert_validation_err(&cfg, "zone_id is empty");
    }

    #[test]
    fn zone_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(valid_zone());
        assert_validation_err(&cfg, "duplicate zone_id");
    }

    #[test]
    fn zone_empty_label_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].label = "  ".into();
        assert_validation_err(&cfg, "label is empty");
    }

    #[test]
    fn zone_bad_start_url_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].start_url = "192.168.1.201/grass1".into();
        assert_validation_err(&cfg, "start_url");
    }

    #[test]
    fn zone_bad_stop_url_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].stop_url = "ftp://example/grass0".into();
        assert_validation_err(&cfg, "stop_url");
    }

    #[test]
    fn actuator_zero_timeout_rejected() {
        let mut cfg = valid_config();
        cfg.actuator.timeout_secs = 0;
        assert_validation_err(&cfg, "timeout_secs must be positive");
    }

    #[test]
    fn actuator_zero_attempts_rejected() {
        let mut cfg = valid_config();
        cfg.actuator.max_attempts = 0;
        assert_validation_err(&cfg, "max_attempts must be at least 1");
    }

    #[test]
    fn actuator_shrinking_backoff_rejected() {
        let mut cfg = valid_config();
        cfg.actuator.backoff_multiplier = 0.5;
        assert_validation_err(&cfg, "backoff_multiplier must be >= 1.0");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.zones[0].zone_id = "".into();
        cfg.zones[0].label = "".into();
        cfg.actuator.max_attempts = 0;
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("zone_id is empty"), "missing id error in: {msg}");
        assert!(msg.contains("label is empty"), "missing label error in: {msg}");
        assert!(msg.contains("max_attempts"), "missing actuator error in: {msg}");
    }

    // -- Zone registry ------------------------------------------------------

    #[test]
    fn zones_registry_lookup() {
        let zones = Zones::from_config(&valid_config());
        assert!(zones.contains("lawn"));
        assert!(!zones.contains("pool"));
        assert_eq!(zones.get("lawn").unwrap().label, "Lawn");
        assert_eq!(zones.len(), 1);
    }

    // -- DB seeding ---------------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_status_rows() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let config = valid_config();
        apply(&config, &db).await.unwrap();

        let statuses = db.all_statuses().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].zone, "lawn");
        assert_eq!(statuses[0].state, crate::db::ZoneState::Off);

        // Re-applying must not reset existing rows.
        db.set_zone_on("lawn", 1_700_000_000).await.unwrap();
        apply(&config, &db).await.unwrap();
        let st = db.zone_status("lawn").await.unwrap().unwrap();
        assert_eq!(st.state, crate::db::ZoneState::On);
    }
}
