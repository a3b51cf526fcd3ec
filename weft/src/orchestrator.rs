//! Remote dispatch: drive a workflow on a registered agent.
//!
//! Every remote execution creates a local run record stamped with the
//! `agent_id`, so local and remote runs share one history. An unreachable
//! agent fails the run with `AgentUnreachable`; a 4xx reply fails it as
//! rejected; 5xx replies are retried with exponential backoff before giving
//! up. Remote runs carry a stub config snapshot and are not restartable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::agents::AgentRegistry;
use crate::error::EngineError;
use crate::runs::{RunRecord, RunRepository, RunStatus};

/// Retries after the first 5xx reply.
const MAX_5XX_RETRIES: u32 = 3;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// What a remote agent expects, from `GET {url}/schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSchema {
    pub workflow: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, AgentInputSpec>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInputSpec {
    #[serde(rename = "type")]
    pub type_decl: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Reply body of `POST {url}/run`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteRunReply {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    repo: Arc<dyn RunRepository>,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(registry: Arc<AgentRegistry>, repo: Arc<dyn RunRepository>) -> Self {
        Self {
            registry,
            repo,
            http: reqwest::Client::new(),
        }
    }

    /// `GET {url}/schema`: the agent's expected-inputs descriptor.
    pub async fn fetch_schema(&self, agent_id: &str) -> Result<AgentSchema, EngineError> {
        let agent = self.registry.get(agent_id).await?;
        let url = format!("{}/schema", agent.url);
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::AgentUnreachable {
                agent_id: agent_id.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(EngineError::AgentRejected {
                agent_id: agent_id.to_string(),
                message: format!("schema endpoint returned {}", response.status()),
            });
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::AgentRejected {
                agent_id: agent_id.to_string(),
                message: format!("schema did not parse: {}", e),
            })
    }

    /// `POST {url}/run` with the given inputs; the run's history lands in the
    /// local repository either way.
    pub async fn execute_on(
        &self,
        agent_id: &str,
        inputs: Value,
    ) -> Result<RunRecord, EngineError> {
        let agent = self.registry.get(agent_id).await?;

        let snapshot = serde_json::json!({"remote_agent": agent_id}).to_string();
        let mut record = RunRecord::new(agent.name.clone(), inputs.clone(), snapshot);
        record.agent_id = Some(agent_id.to_string());
        self.repo.create(&record).await?;
        let run_id = record.run_id;
        self.repo
            .update_status(run_id, RunStatus::Running, None)
            .await?;

        match self.dispatch(&agent.url, &inputs, agent_id).await {
            Ok(reply) => {
                let cost = reply.cost_usd.unwrap_or(0.0);
                let duration = reply.duration_seconds.unwrap_or(0.0);
                let mut metrics = BTreeMap::new();
                metrics.insert("cost_usd".to_string(), cost);
                metrics.insert("duration_seconds".to_string(), duration);
                self.repo
                    .update_completion(run_id, &reply.outputs, &metrics, duration, cost)
                    .await?;
                let status = match reply.status.as_deref() {
                    Some("failed") => RunStatus::Failed,
                    _ => RunStatus::Completed,
                };
                self.repo
                    .update_status(run_id, status, reply.error.clone())
                    .await?;
            }
            Err(e) => {
                warn!(run_id = %run_id, agent_id, error = %e, "remote dispatch failed");
                self.repo
                    .update_status(run_id, RunStatus::Failed, Some(e.to_string()))
                    .await?;
            }
        }

        self.repo
            .get(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    async fn dispatch(
        &self,
        url: &str,
        inputs: &Value,
        agent_id: &str,
    ) -> Result<RemoteRunReply, EngineError> {
        let run_url = format!("{}/run", url);
        let body = serde_json::json!({ "inputs": inputs });

        for attempt in 0..=MAX_5XX_RETRIES {
            let response = self
                .http
                .post(&run_url)
                .timeout(REQUEST_TIMEOUT)
                .json(&body)
                .send()
                .await
                .map_err(|e| EngineError::AgentUnreachable {
                    agent_id: agent_id.to_string(),
                    message: e.to_string(),
                })?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json()
                    .await
                    .map_err(|e| EngineError::AgentRejected {
                        agent_id: agent_id.to_string(),
                        message: format!("run reply did not parse: {}", e),
                    });
            }
            if status.is_client_error() {
                let text = response.text().await.unwrap_or_default();
                return Err(EngineError::AgentRejected {
                    agent_id: agent_id.to_string(),
                    message: format!("{}: {}", status, text.chars().take(200).collect::<String>()),
                });
            }
            // 5xx: back off and retry.
            if attempt < MAX_5XX_RETRIES {
                let delay = RETRY_BACKOFF * 2u32.pow(attempt);
                debug!(url = %run_url, %status, attempt, delay_ms = delay.as_millis() as u64, "retrying remote run");
                tokio::time::sleep(delay).await;
            }
        }
        Err(EngineError::AgentRejected {
            agent_id: agent_id.to_string(),
            message: format!("server errors persisted after {} retries", MAX_5XX_RETRIES),
        })
    }
}
