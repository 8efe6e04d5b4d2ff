//! Client for the remote text-scoring service (a LanguageTool-style `check` endpoint).

use crate::config::EstimateStep;
use crate::error::{Result, StepError};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const STEP: &str = "estimate-quality";

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    matches: Vec<serde_json::Value>,
}

#[derive(Clone)]
pub struct ScoringClient {
    url: String,
    language: String,
    enabled_rules: String,
    agent: ureq::Agent,
}

impl ScoringClient {
    pub fn new(cfg: &EstimateStep) -> Self {
        let timeout = Duration::from_secs(cfg.timeout_seconds.max(1));
        Self {
            url: cfg.service_url.clone(),
            language: cfg.language.clone(),
            enabled_rules: cfg.enabled_rules.join(","),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(timeout)
                .timeout(timeout)
                .build(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of matches the service reports for `text`.
    ///
    /// A connection-level failure is [`StepError::ServiceUnavailable`]; an
    /// answer with a non-success status is a plain step failure.
    pub fn count_errors(&self, text: &str) -> Result<usize> {
        let mut form = vec![("language", self.language.as_str()), ("text", text)];
        if !self.enabled_rules.is_empty() {
            form.push(("enabledRules", self.enabled_rules.as_str()));
            form.push(("enabledOnly", "true"));
        }

        let response = match self.agent.post(&self.url).send_form(&form) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(StepError::failed(
                    STEP,
                    format!("scoring service answered {code}: {}", body.trim()),
                )
                .into());
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(StepError::ServiceUnavailable {
                    url: self.url.clone(),
                    message: transport.to_string(),
                }
                .into());
            }
        };

        let parsed: CheckResponse = response
            .into_json()
            .map_err(|e| StepError::failed(STEP, format!("unreadable scoring response: {e}")))?;
        debug!(matches = parsed.matches.len(), "scoring response");
        Ok(parsed.matches.len())
    }
}
