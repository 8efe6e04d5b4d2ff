//! Outward callbacks: job-status updates towards the record server and
//! operator notifications. Only the signatures matter to the core.

use crate::config::Notify;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Open,
    Busy,
    Done,
    Fail,
    Skip,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Open => "OPEN",
            JobStatus::Busy => "BUSY",
            JobStatus::Done => "DONE",
            JobStatus::Fail => "FAIL",
            JobStatus::Skip => "SKIP",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

pub type StatusInfo = BTreeMap<String, String>;

pub trait StatusReporter: Send + Sync {
    fn update(&self, status: JobStatus, job_id: &str, info: &StatusInfo) -> Result<(), HookError>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, message: &str) -> Result<(), HookError>;
}

/// Reports status transitions to the log only.
#[derive(Debug, Default)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn update(&self, status: JobStatus, job_id: &str, info: &StatusInfo) -> Result<(), HookError> {
        info!(%status, job_id, ?info, "job status");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, message: &str) -> Result<(), HookError> {
        warn!(subject, "{message}");
        Ok(())
    }
}

/// Posts `{subject, message}` as JSON to a configured endpoint.
pub struct WebhookNotifier {
    url: String,
    subject_prefix: String,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(cfg: &Notify) -> Self {
        let timeout = Duration::from_secs(cfg.timeout_seconds.max(1));
        Self {
            url: cfg.webhook_url.clone(),
            subject_prefix: cfg.subject_prefix.clone(),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(timeout)
                .timeout(timeout)
                .build(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, subject: &str, message: &str) -> Result<(), HookError> {
        let subject = format!("{} {subject}", self.subject_prefix);
        self.agent
            .post(&self.url)
            .send_json(serde_json::json!({ "subject": subject, "message": message }))
            .map(|_| ())
            .map_err(|e| HookError(format!("webhook {}: {e}", self.url)))
    }
}

/// Picks the webhook notifier when a URL is configured, otherwise the log.
pub fn notifier_from_config(cfg: &Notify) -> Box<dyn Notifier> {
    if cfg.webhook_url.trim().is_empty() {
        Box::new(LogNotifier)
    } else {
        Box::new(WebhookNotifier::new(cfg))
    }
}

/// Best-effort delivery: failures are logged and dropped.
pub fn notify_quietly(notifier: &dyn Notifier, subject: &str, message: &str) {
    if let Err(err) = notifier.notify(subject, message) {
        warn!(subject, "notification failed: {err}");
    }
}

pub fn update_quietly(reporter: &dyn StatusReporter, status: JobStatus, job_id: &str, info: &StatusInfo) {
    if let Err(err) = reporter.update(status, job_id, info) {
        warn!(%status, job_id, "status update failed: {err}");
    }
}
