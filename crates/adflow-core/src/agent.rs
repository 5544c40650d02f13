//! Agent boundary
//!
//! Step units of the creative pipeline reach the AI services (copywriting,
//! image/video/audio generation, compliance checks, publishing) through
//! [`AgentClient`]. Provider SDK wrappers live outside this crate.

use crate::error::AgentError;
use adflow_kernel::RunId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

/// Which agent a request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Brief,
    Image,
    Video,
    Audio,
    Compliance,
    Publish,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Brief => "brief",
            AgentKind::Image => "image",
            AgentKind::Video => "video",
            AgentKind::Audio => "audio",
            AgentKind::Compliance => "compliance",
            AgentKind::Publish => "publish",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub agent: AgentKind,
    pub run_id: RunId,
    pub prompt: String,
    /// Structured inputs: run input and the results the prompt was built from
    pub context: Value,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn call(&self, request: AgentRequest) -> Result<Value, AgentError>;
}

/// Deterministic offline stand-in for the agent services, with failure
/// injection for demos and tests.
#[derive(Debug, Default)]
pub struct SimulatedAgentClient {
    latency: Option<Duration>,
    failures: Mutex<HashMap<AgentKind, VecDeque<AgentError>>>,
    compliance_verdicts: Mutex<VecDeque<bool>>,
    calls: DashMap<AgentKind, u32>,
}

impl SimulatedAgentClient {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue an error for the next call to `agent`.
    pub fn fail_next(&self, agent: AgentKind, error: AgentError) {
        self.failures.lock().entry(agent).or_default().push_back(error);
    }

    /// Queue the verdict of the next compliance check (default: pass).
    pub fn next_compliance(&self, passed: bool) {
        self.compliance_verdicts.lock().push_back(passed);
    }

    #[must_use]
    pub fn calls(&self, agent: AgentKind) -> u32 {
        self.calls.get(&agent).map_or(0, |c| *c)
    }

    fn respond(&self, request: &AgentRequest, call: u32) -> Value {
        let slug = format!("{}-{}-{call}", request.run_id, request.agent);
        match request.agent {
            AgentKind::Brief => json!({
                "headline": format!("Campaign brief #{call}"),
                "body": request.prompt,
                "tone": "upbeat",
            }),
            AgentKind::Image => json!({ "url": format!("sim://image/{slug}.png"), "width": 1080, "height": 1080 }),
            AgentKind::Video => json!({ "url": format!("sim://video/{slug}.mp4"), "seconds": 15 }),
            AgentKind::Audio => json!({ "url": format!("sim://audio/{slug}.mp3"), "seconds": 15 }),
            AgentKind::Compliance => {
                let passed = self.compliance_verdicts.lock().pop_front().unwrap_or(true);
                let findings: Vec<&str> = if passed { vec![] } else { vec!["unapproved claim in copy"] };
                json!({ "passed": passed, "findings": findings })
            }
            AgentKind::Publish => json!({
                "publishedUrl": format!("sim://cdn/{slug}"),
                "channels": ["web", "social"],
            }),
        }
    }
}

#[async_trait]
impl AgentClient for SimulatedAgentClient {
    async fn call(&self, request: AgentRequest) -> Result<Value, AgentError> {
        let call = {
            let mut count = self.calls.entry(request.agent).or_insert(0);
            *count += 1;
            *count
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .failures
            .lock()
            .get_mut(&request.agent)
            .and_then(VecDeque::pop_front);
        if let Some(error) = injected {
            tracing::debug!(agent = %request.agent, %error, "simulated agent failure");
            return Err(error);
        }
        Ok(self.respond(&request, call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(agent: AgentKind) -> AgentRequest {
        AgentRequest {
            agent,
            run_id: RunId::new(),
            prompt: "sneakers for runners".into(),
            context: json!({}),
        }
    }

    #[tokio::test]
    async fn injected_failures_are_served_once() {
        let client = SimulatedAgentClient::new();
        client.fail_next(AgentKind::Image, AgentError::Unavailable("503".into()));

        assert!(client.call(request(AgentKind::Image)).await.is_err());
        let ok = client.call(request(AgentKind::Image)).await.unwrap();
        assert!(ok["url"].as_str().unwrap().ends_with(".png"));
        assert_eq!(client.calls(AgentKind::Image), 2);
        assert_eq!(client.calls(AgentKind::Video), 0);
    }

    #[tokio::test]
    async fn compliance_verdicts_are_queued() {
        let client = SimulatedAgentClient::new();
        client.next_compliance(false);

        let first = client.call(request(AgentKind::Compliance)).await.unwrap();
        assert_eq!(first["passed"], false);
        let second = client.call(request(AgentKind::Compliance)).await.unwrap();
        assert_eq!(second["passed"], true);
    }

    #[test]
    fn request_serializes_camel_case() {
        let value = serde_json::to_value(request(AgentKind::Brief)).unwrap();
        assert_eq!(value["agent"], "brief");
        assert!(value["runId"].is_string());
    }
}
