//! Push notification delivery. Strictly best-effort: messages are
//! handed off to a background task and failures are only logged, so a
//! slow or unreachable Pushover API can never stall a state transition.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::PushoverConfig;

const PUSHOVER_API: &str = "https://api.pushover.net/1/messages.json";

pub trait Notifier: Send + Sync {
    /// Queue a message for delivery. Must not block and must not fail.
    fn notify(&self, message: String);
}

pub type SharedNotifier = Arc<dyn Notifier>;

// ---------------------------------------------------------------------------
// Pushover
// ---------------------------------------------------------------------------

pub struct PushoverNotifier {
    http: reqwest::Client,
    token: String,
    user: String,
}

impl PushoverNotifier {
    pub fn new(cfg: &PushoverConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build pushover http client")?;

        Ok(Self {
            http,
            token: cfg.token.clone(),
            user: cfg.user.clone(),
        })
    }
}

impl Notifier for PushoverNotifier {
    fn notify(&self, message: String) {
        let http = self.http.clone();
        let token = self.token.clone();
        let user = self.user.clone();

        tokio::spawn(async move {
            let result = http
                .post(PUSHOVER_API)
                .form(&[
                    ("token", token.as_str()),
                    ("user", user.as_str()),
                    ("message", message.as_str()),
                ])
                .send()
                .await
                .and_then(|r| r.error_for_status());

            if let Err(e) = result {
                error!("pushover notification failed: {e}");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Log-only fallback (no pushover credentials configured)
// ---------------------------------------------------------------------------

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: String) {
        info!(notification = %message);
    }
}

// ---------------------------------------------------------------------------
// Test notifier
// ---------------------------------------------------------------------------

/// Records every message so tests can assert on notification counts
/// and wording.
#[cfg(test)]
pub(crate) struct RecordingNotifier(std::sync::Mutex<Vec<String>>);

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn new() -> Self {
        Self(std::sync::Mutex::new(Vec::new()))
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, message: String) {
        self.0.lock().unwrap().push(message);
    }
}
