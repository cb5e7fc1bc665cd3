//! Remote forwarder: proxies jobs to a separate worker service over HTTP.
//!
//! The worker answers `GET /` with `{"status": "<token>"}` when it is up and
//! accepts jobs on `POST /process` and `POST /process/stress`. Every call here
//! is blocking and carries its own timeout.
//!
//! - [`RemoteForwarder::health_check`] is never cached; [`RemoteForwarder::forward`]
//!   runs one before each attempt.
//! - Worker responses are passed through untouched, whatever their status.
//! - Transport failures collapse into [`ForwardError::Unreachable`], whose
//!   message never carries the underlying error text.
//! - [`RemoteForwarder::forward_stress`] sends one request at a time, counting
//!   failures instead of stopping on them.

use crate::types::HealthStatus;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PROCESS_PATH: &str = "/process";
pub const STRESS_PATH: &str = "/process/stress";

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Worker service unhealthy: {state}")]
    Unhealthy { state: String },
    /// `reason` is for logs only.
    #[error("Worker service unreachable")]
    Unreachable { reason: String },
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwarderConfig {
    pub base_url: String,
    /// Value the worker must report in `status` to count as healthy.
    pub expected_status: String,
    pub health_timeout: Duration,
    pub forward_timeout: Duration,
    /// Timeout for a forwarded `/process/stress` job.
    pub stress_job_timeout: Duration,
    /// Timeout for each attempt inside [`RemoteForwarder::forward_stress`].
    pub stress_attempt_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5001".into(),
            expected_status: "worker service running".into(),
            health_timeout: Duration::from_secs(5),
            forward_timeout: Duration::from_secs(120),
            stress_job_timeout: Duration::from_secs(300),
            stress_attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// A worker response, passed through as received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forwarded {
    pub status: u16,
    /// Parsed JSON, or the raw text as a JSON string when it was not JSON.
    pub body: Value,
}

impl Forwarded {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outcome of a network stress window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressSummary {
    /// Requested window, in seconds.
    pub duration: u64,
    pub requests_sent: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone)]
pub struct RemoteForwarder {
    config: ForwarderConfig,
    client: Client,
}

impl RemoteForwarder {
    pub fn new(mut config: ForwarderConfig) -> Result<Self, ForwardError> {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let client = Client::builder().build().map_err(ForwardError::Client)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    /// Probe the worker. Healthy only on a 2xx whose JSON body reports the
    /// expected status; anything else, including a timeout, is unhealthy.
    pub fn health_check(&self) -> HealthStatus {
        let response = match self
            .client
            .get(self.url("/"))
            .timeout(self.config.health_timeout)
            .send()
        {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "health probe failed");
                return HealthStatus::unreachable(transport_reason(&e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return HealthStatus::unreachable(format!("HTTP {}", status.as_u16()));
        }
        let body: Value = match response.json() {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "health probe body unreadable");
                return HealthStatus::unreachable("unexpected response body");
            }
        };
        match body.get("status").and_then(Value::as_str) {
            Some(state) => HealthStatus {
                reachable: state == self.config.expected_status,
                reported_state: state.to_string(),
            },
            None => HealthStatus::unreachable("unexpected response body"),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health_check().reachable
    }

    /// POST `payload` to `path` without a health check.
    pub fn forward_job(
        &self,
        path: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Forwarded, ForwardError> {
        let url = self.url(path);
        debug!(%url, ?timeout, "forwarding job");
        let response = self
            .client
            .post(&url)
            .json(payload)
            .timeout(timeout)
            .send()
            .map_err(unreachable)?;
        let status = response.status().as_u16();
        let text = response.text().map_err(unreachable)?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(Forwarded { status, body })
    }

    /// Health-check, then forward.
    pub fn forward(
        &self,
        path: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Forwarded, ForwardError> {
        let health = self.health_check();
        if !health.reachable {
            warn!(state = %health.reported_state, "worker not healthy, not forwarding");
            return Err(ForwardError::Unhealthy {
                state: health.reported_state,
            });
        }
        self.forward_job(path, payload, timeout)
    }

    /// Forward a heavy job back to back until `duration` has elapsed.
    ///
    /// At least one attempt is always made. An attempt succeeds when the
    /// worker was healthy and answered 2xx; everything else is a failure.
    pub fn forward_stress(&self, filename: &str, duration: Duration) -> StressSummary {
        let payload = heavy_payload(filename);
        let started = Instant::now();
        let mut summary = StressSummary {
            duration: duration.as_secs(),
            requests_sent: 0,
            successes: 0,
            failures: 0,
        };
        info!(filename, ?duration, "starting remote stress");

        loop {
            summary.requests_sent += 1;
            match self.forward(PROCESS_PATH, &payload, self.config.stress_attempt_timeout) {
                Ok(resp) if resp.is_success() => summary.successes += 1,
                Ok(resp) => {
                    debug!(status = resp.status, "stress attempt rejected");
                    summary.failures += 1;
                }
                Err(e) => {
                    debug!(error = %e, "stress attempt failed");
                    summary.failures += 1;
                }
            }
            if started.elapsed() >= duration {
                break;
            }
        }

        info!(
            sent = summary.requests_sent,
            successes = summary.successes,
            failures = summary.failures,
            "remote stress finished"
        );
        summary
    }
}

/// Upscale plus a small rotation: expensive enough to load the worker.
pub fn heavy_payload(filename: &str) -> Value {
    json!({
        "filename": filename,
        "operations": {"upscale": 2, "rotate": 5},
    })
}

fn unreachable(e: reqwest::Error) -> ForwardError {
    warn!(error = %e, "worker transport failure");
    ForwardError::Unreachable {
        reason: transport_reason(&e),
    }
}

fn transport_reason(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timed out".into()
    } else if e.is_connect() {
        "connection failed".into()
    } else {
        "transport error".into()
    }
}
