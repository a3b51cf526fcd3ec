//! In-process run repository for single-node installs and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{RunFilter, RunRecord, RunRepository, RunStatus};
use crate::error::EngineError;

#[derive(Default)]
pub struct MemoryRunRepository {
    records: DashMap<Uuid, RunRecord>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for MemoryRunRepository {
    async fn create(&self, record: &RunRecord) -> Result<(), EngineError> {
        self.records.insert(record.run_id, record.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::RunNotFound(id))?;
        record.status = status;
        if status.is_terminal() {
            record.completed_at = Some(Utc::now());
        }
        if error.is_some() {
            record.error = error;
        }
        Ok(())
    }

    async fn append_outputs(
        &self,
        id: Uuid,
        partial: &BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::RunNotFound(id))?;
        if let Value::Object(map) = &mut record.outputs {
            for (k, v) in partial {
                map.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn update_completion(
        &self,
        id: Uuid,
        outputs: &Value,
        metrics: &BTreeMap<String, f64>,
        duration_seconds: f64,
        cost_usd: f64,
    ) -> Result<(), EngineError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::RunNotFound(id))?;
        record.outputs = outputs.clone();
        record.metrics = metrics.clone();
        record.duration_seconds = Some(duration_seconds);
        record.cost_usd = Some(cost_usd);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, EngineError> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, EngineError> {
        let mut records: Vec<RunRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn list_by_agent(&self, agent_id: &str) -> Result<Vec<RunRecord>, EngineError> {
        let mut records: Vec<RunRecord> = self
            .records
            .iter()
            .filter(|r| r.agent_id.as_deref() == Some(agent_id))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_update_get() {
        let repo = MemoryRunRepository::new();
        let record = RunRecord::new("wf", json!({"k": "v"}), "{}".into());
        let id = record.run_id;
        repo.create(&record).await.unwrap();

        repo.update_status(id, RunStatus::Running, None).await.unwrap();
        repo.append_outputs(id, &[("a".to_string(), json!(1))].into_iter().collect())
            .await
            .unwrap();
        repo.update_status(id, RunStatus::Completed, None).await.unwrap();

        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.outputs["a"], json!(1));
        assert!(stored.completed_at.is_some());
        assert!(stored.started_at <= stored.completed_at.unwrap());
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let repo = MemoryRunRepository::new();
        for name in ["a", "b", "a"] {
            let record = RunRecord::new(name, json!({}), "{}".into());
            repo.create(&record).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let all = repo.list(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].started_at >= all[1].started_at);

        let only_a = repo
            .list(&RunFilter {
                workflow: Some("a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_a.len(), 2);
    }

    #[tokio::test]
    async fn update_on_unknown_run_errors() {
        let repo = MemoryRunRepository::new();
        let err = repo
            .update_status(Uuid::new_v4(), RunStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(_)));
    }
}
