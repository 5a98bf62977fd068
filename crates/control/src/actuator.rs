//! HTTP client for the remote actuator endpoint. Commands are
//! fire-and-forget GETs expected to return 2xx; failures are retried
//! with exponential backoff and reported to the caller as a plain bool.
//! Backoff sleeps are local to the calling task, never under a lock.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, warn};

use crate::config::ActuatorConfig;

#[derive(Clone)]
pub struct ActuatorClient {
    http: reqwest::Client,
    max_attempts: u32,
    backoff_start: Duration,
    backoff_multiplier: f64,
}

impl ActuatorClient {
    pub fn new(cfg: &ActuatorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .context("failed to build actuator http client")?;

        Ok(Self {
            http,
            max_attempts: cfg.max_attempts,
            backoff_start: cfg.backoff_start(),
            backoff_multiplier: cfg.backoff_multiplier,
        })
    }

    /// Send one command. Returns true only if some attempt got a 2xx
    /// response; all failure modes are logged and reported as false.
    pub async fn send(&self, url: &str) -> bool {
        let mut backoff = self.backoff_start;

        for attempt in 1..=self.max_attempts {
            match self.http.get(url).send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => return true,
                Err(e) => {
                    warn!(url, attempt, max_attempts = self.max_attempts, "actuator command failed: {e}");
                    if attempt < self.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.mul_f64(self.backoff_multiplier);
                    }
                }
            }
        }

        error!(url, "actuator command gave up after {} attempts", self.max_attempts);
        false
    }
}

// ---------------------------------------------------------------------------
// Test support: a minimal local HTTP endpoint with a canned status code
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
