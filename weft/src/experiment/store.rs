//! Experiment store: opaque read/write façade for A/B run data.
//!
//! The backend may be down at runtime; callers treat `StoreUnavailable` as a
//! soft error and render a degraded view instead of failing. Backends:
//! in-memory (tests, single process) and a SQLite table in its own database
//! file (the experiment store is a separate collaborator from the run
//! repository).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::runs::RunStatus;

/// One experiment-tagged run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRun {
    pub experiment_name: String,
    pub variant_name: String,
    pub run_id: Uuid,
    pub metrics: BTreeMap<String, f64>,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
}

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn log_run(&self, run: &ExperimentRun) -> Result<(), EngineError>;

    async fn list_experiments(&self) -> Result<Vec<String>, EngineError>;

    /// Runs of one experiment, optionally narrowed to a variant.
    async fn list_runs(
        &self,
        experiment_name: &str,
        variant: Option<&str>,
    ) -> Result<Vec<ExperimentRun>, EngineError>;

    /// Per-variant aggregate of `metric`, computed from `list_runs`.
    async fn get_aggregate(
        &self,
        experiment_name: &str,
        metric: &str,
    ) -> Result<Vec<super::VariantStats>, EngineError> {
        let runs = self.list_runs(experiment_name, None).await?;
        Ok(super::aggregate(&runs, metric))
    }
}

#[derive(Default)]
pub struct MemoryExperimentStore {
    runs: Mutex<Vec<ExperimentRun>>,
}

impl MemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExperimentStore for MemoryExperimentStore {
    async fn log_run(&self, run: &ExperimentRun) -> Result<(), EngineError> {
        self.runs
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("experiment store poisoned".into()))?
            .push(run.clone());
        Ok(())
    }

    async fn list_experiments(&self) -> Result<Vec<String>, EngineError> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("experiment store poisoned".into()))?;
        let mut names: Vec<String> = runs.iter().map(|r| r.experiment_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn list_runs(
        &self,
        experiment_name: &str,
        variant: Option<&str>,
    ) -> Result<Vec<ExperimentRun>, EngineError> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("experiment store poisoned".into()))?;
        Ok(runs
            .iter()
            .filter(|r| r.experiment_name == experiment_name)
            .filter(|r| variant.map_or(true, |v| r.variant_name == v))
            .cloned()
            .collect())
    }
}

/// SQLite experiment store; same open-per-call pattern as the other stores,
/// but every failure maps to `StoreUnavailable` so the dashboard degrades
/// instead of erroring.
pub struct SqliteExperimentStore {
    db_path: PathBuf,
}

fn unavailable(e: impl std::fmt::Display) -> EngineError {
    EngineError::StoreUnavailable(e.to_string())
}

impl SqliteExperimentStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path).map_err(unavailable)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS experiment_runs (
                experiment_name TEXT NOT NULL,
                variant_name TEXT NOT NULL,
                run_id TEXT NOT NULL,
                metrics TEXT NOT NULL,
                started_at TEXT NOT NULL,
                status TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(unavailable)?;
        Ok(Self { db_path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path).map_err(unavailable)?;
            f(&conn)
        })
        .await
        .map_err(unavailable)?
    }
}

fn row_to_run(row: &Row<'_>) -> Result<ExperimentRun, EngineError> {
    let run_id: String = row.get(2).map_err(unavailable)?;
    let metrics: String = row.get(3).map_err(unavailable)?;
    let started_at: String = row.get(4).map_err(unavailable)?;
    let status: String = row.get(5).map_err(unavailable)?;
    Ok(ExperimentRun {
        experiment_name: row.get(0).map_err(unavailable)?,
        variant_name: row.get(1).map_err(unavailable)?,
        run_id: run_id.parse().map_err(unavailable)?,
        metrics: serde_json::from_str(&metrics).map_err(unavailable)?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(unavailable)?,
        status: status.parse::<RunStatus>().map_err(EngineError::StoreUnavailable)?,
    })
}

#[async_trait]
impl ExperimentStore for SqliteExperimentStore {
    async fn log_run(&self, run: &ExperimentRun) -> Result<(), EngineError> {
        let run = run.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO experiment_runs (experiment_name, variant_name, run_id, metrics, \
                 started_at, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.experiment_name,
                    run.variant_name,
                    run.run_id.to_string(),
                    serde_json::to_string(&run.metrics).map_err(unavailable)?,
                    run.started_at.to_rfc3339(),
                    run.status.as_str(),
                ],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn list_experiments(&self) -> Result<Vec<String>, EngineError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT experiment_name FROM experiment_runs ORDER BY experiment_name",
                )
                .map_err(unavailable)?;
            let mut rows = stmt.query([]).map_err(unavailable)?;
            let mut names = Vec::new();
            while let Some(row) = rows.next().map_err(unavailable)? {
                names.push(row.get(0).map_err(unavailable)?);
            }
            Ok(names)
        })
        .await
    }

    async fn list_runs(
        &self,
        experiment_name: &str,
        variant: Option<&str>,
    ) -> Result<Vec<ExperimentRun>, EngineError> {
        let experiment_name = experiment_name.to_string();
        let variant = variant.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let mut runs = Vec::new();
            match variant {
                Some(variant) => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT experiment_name, variant_name, run_id, metrics, started_at, \
                             status FROM experiment_runs \
                             WHERE experiment_name = ?1 AND variant_name = ?2 ORDER BY started_at",
                        )
                        .map_err(unavailable)?;
                    let mut rows = stmt
                        .query(params![experiment_name, variant])
                        .map_err(unavailable)?;
                    while let Some(row) = rows.next().map_err(unavailable)? {
                        runs.push(row_to_run(row)?);
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT experiment_name, variant_name, run_id, metrics, started_at, \
                             status FROM experiment_runs \
                             WHERE experiment_name = ?1 ORDER BY started_at",
                        )
                        .map_err(unavailable)?;
                    let mut rows = stmt.query(params![experiment_name]).map_err(unavailable)?;
                    while let Some(row) = rows.next().map_err(unavailable)? {
                        runs.push(row_to_run(row)?);
                    }
                }
            }
            Ok(runs)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(experiment: &str, variant: &str, cost: f64) -> ExperimentRun {
        ExperimentRun {
            experiment_name: experiment.to_string(),
            variant_name: variant.to_string(),
            run_id: Uuid::new_v4(),
            metrics: [("cost_usd".to_string(), cost)].into_iter().collect(),
            started_at: Utc::now(),
            status: RunStatus::Completed,
        }
    }

    #[tokio::test]
    async fn memory_store_lists_and_filters() {
        let store = MemoryExperimentStore::new();
        store.log_run(&run("exp-a", "a", 0.1)).await.unwrap();
        store.log_run(&run("exp-a", "b", 0.2)).await.unwrap();
        store.log_run(&run("exp-b", "a", 0.3)).await.unwrap();

        assert_eq!(store.list_experiments().await.unwrap(), vec!["exp-a", "exp-b"]);
        assert_eq!(store.list_runs("exp-a", None).await.unwrap().len(), 2);
        assert_eq!(store.list_runs("exp-a", Some("b")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sqlite_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteExperimentStore::new(dir.path().join("experiments.db")).unwrap();
        let logged = run("exp", "a", 0.05);
        store.log_run(&logged).await.unwrap();

        let runs = store.list_runs("exp", None).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, logged.run_id);
        assert_eq!(runs[0].metrics.get("cost_usd"), Some(&0.05));
        assert_eq!(store.list_experiments().await.unwrap(), vec!["exp"]);
    }
}
