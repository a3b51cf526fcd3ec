//! Run records and the storage-backend-agnostic repository.
//!
//! A [`RunRecord`] is created when a run is enqueued and mutated through the
//! repository as the run progresses. Status transitions are monotonic
//! (`pending → running → completed|failed|cancelled`) except the direct
//! `pending → cancelled` hop. `config_snapshot` holds the exact declaration
//! (canonical JSON) so a restart can re-materialize it deterministically;
//! restarts link back through `parent_run_id`.
//!
//! Two backends ship: [`MemoryRunRepository`](memory::MemoryRunRepository)
//! for single-process installs and
//! [`SqliteRunRepository`](sqlite::SqliteRunRepository), the shared relational
//! store for the multi-process control plane. Every write is per-call atomic;
//! there is no cross-call transaction.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status `{}`", other)),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a plan with a specific input binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub inputs: Value,
    pub outputs: Value,
    /// Canonical JSON of the exact declaration used.
    pub config_snapshot: String,
    pub agent_id: Option<String>,
    pub parent_run_id: Option<Uuid>,
    pub duration_seconds: Option<f64>,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

impl RunRecord {
    pub fn new(workflow_name: impl Into<String>, inputs: Value, config_snapshot: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            inputs,
            outputs: Value::Object(serde_json::Map::new()),
            config_snapshot,
            agent_id: None,
            parent_run_id: None,
            duration_seconds: None,
            cost_usd: None,
            error: None,
            metrics: BTreeMap::new(),
        }
    }
}

/// Filter for `list`. All criteria are conjunctive; `limit` applies after
/// ordering by `started_at` descending.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub workflow: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn matches(&self, record: &RunRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(ref workflow) = self.workflow {
            if &record.workflow_name != workflow {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.started_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.started_at > until {
                return false;
            }
        }
        true
    }
}

/// Persistence seam for run records. Writes are per-call atomic.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create(&self, record: &RunRecord) -> Result<(), EngineError>;

    async fn update_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), EngineError>;

    /// Merges partial outputs into the record (per-node observations).
    async fn append_outputs(
        &self,
        id: Uuid,
        partial: &BTreeMap<String, Value>,
    ) -> Result<(), EngineError>;

    async fn update_completion(
        &self,
        id: Uuid,
        outputs: &Value,
        metrics: &BTreeMap<String, f64>,
        duration_seconds: f64,
        cost_usd: f64,
    ) -> Result<(), EngineError>;

    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, EngineError>;

    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, EngineError>;

    async fn list_by_agent(&self, agent_id: &str) -> Result<Vec<RunRecord>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn filter_matches_conjunctively() {
        let mut record = RunRecord::new("wf", serde_json::json!({}), "{}".into());
        record.status = RunStatus::Completed;
        let filter = RunFilter {
            status: Some(RunStatus::Completed),
            workflow: Some("wf".into()),
            ..Default::default()
        };
        assert!(filter.matches(&record));

        let wrong_wf = RunFilter {
            workflow: Some("other".into()),
            ..Default::default()
        };
        assert!(!wrong_wf.matches(&record));
    }
}
