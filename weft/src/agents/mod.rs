//! Agent registry: TTL-based liveness tracking for remote agents.
//!
//! Membership is a record per agent; liveness is never stored, always derived
//! at read time as `now - last_heartbeat <= ttl_seconds`. There is no expiry
//! sweep: stale records stay queryable as unavailable until a heartbeat
//! resumes or an operator deregisters them. By convention agents heartbeat at
//! most every `ttl_seconds / 3`.

pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;
use store::AgentStore;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One registered remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub url: String,
    pub metadata: Value,
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl AgentRecord {
    /// The liveness predicate, evaluated against an explicit clock.
    pub fn alive_at(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.last_heartbeat);
        elapsed.num_seconds() <= self.ttl_seconds as i64
    }
}

/// A record plus its derived `alive` flag; what list endpoints return.
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub alive: bool,
}

/// Registration request.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAgent {
    pub agent_id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
}

fn default_ttl() -> u64 {
    60
}

pub struct AgentRegistry {
    store: Arc<dyn AgentStore>,
    http: reqwest::Client,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
        }
    }

    /// Upserts a record; `registered_at` and `last_heartbeat` reset to now.
    pub async fn register(&self, request: RegisterAgent) -> Result<AgentRecord, EngineError> {
        let now = Utc::now();
        let record = AgentRecord {
            agent_id: request.agent_id,
            name: request.name,
            url: request.url.trim_end_matches('/').to_string(),
            metadata: request.metadata,
            capabilities: request.capabilities,
            registered_at: now,
            last_heartbeat: now,
            ttl_seconds: request.ttl_seconds,
        };
        self.store.upsert(&record).await?;
        debug!(agent_id = %record.agent_id, url = %record.url, "agent registered");
        Ok(record)
    }

    /// Refreshes `last_heartbeat`. Never creates a record.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<(), EngineError> {
        if self.store.touch_heartbeat(agent_id, Utc::now()).await? {
            Ok(())
        } else {
            Err(EngineError::AgentNotFound(agent_id.to_string()))
        }
    }

    pub async fn deregister(&self, agent_id: &str) -> Result<(), EngineError> {
        if self.store.remove(agent_id).await? {
            Ok(())
        } else {
            Err(EngineError::AgentNotFound(agent_id.to_string()))
        }
    }

    pub async fn get(&self, agent_id: &str) -> Result<AgentRecord, EngineError> {
        self.store
            .get(agent_id)
            .await?
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))
    }

    /// All records with `alive` computed against the current clock; never
    /// cached. `only_alive` narrows the listing.
    pub async fn list(&self, only_alive: bool) -> Result<Vec<AgentView>, EngineError> {
        let now = Utc::now();
        let mut views: Vec<AgentView> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|record| AgentView {
                alive: record.alive_at(now),
                record,
            })
            .filter(|v| !only_alive || v.alive)
            .collect();
        views.sort_by(|a, b| a.record.agent_id.cmp(&b.record.agent_id));
        Ok(views)
    }

    /// Best-effort `GET {url}/health`. Does not mutate `last_heartbeat`; a
    /// probe is an operator check, not a heartbeat.
    pub async fn health_probe(&self, agent_id: &str) -> Result<bool, EngineError> {
        let record = self.get(agent_id).await?;
        Ok(self.probe_url(&record.url).await)
    }

    /// Reachability check against a bare URL (used before registration).
    pub async fn probe_url(&self, url: &str) -> bool {
        let health = format!("{}/health", url.trim_end_matches('/'));
        match self
            .http
            .get(&health)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %health, error = %e, "health probe failed");
                false
            }
        }
    }
}
