//! SQLite-backed run repository. Persistent across process restarts and
//! shared by every control-plane process pointing at the same file.
//!
//! Connections open per call from the stored path inside `spawn_blocking`;
//! each statement is one write, which is all the atomicity the repository
//! contract asks for.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use uuid::Uuid;

use super::{RunFilter, RunRecord, RunRepository, RunStatus};
use crate::error::EngineError;

pub struct SqliteRunRepository {
    db_path: PathBuf,
}

fn storage(e: impl std::fmt::Display) -> EngineError {
    EngineError::Storage(e.to_string())
}

impl SqliteRunRepository {
    /// Opens (creating if needed) the database and ensures the table exists.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path).map_err(storage)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                workflow_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                inputs TEXT NOT NULL,
                outputs TEXT NOT NULL,
                config_snapshot TEXT NOT NULL,
                agent_id TEXT,
                parent_run_id TEXT,
                duration_seconds REAL,
                cost_usd REAL,
                error TEXT,
                metrics TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(storage)?;
        Ok(Self { db_path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path).map_err(storage)?;
            f(&conn)
        })
        .await
        .map_err(storage)?
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(storage)
}

fn row_to_record(row: &Row<'_>) -> Result<RunRecord, EngineError> {
    let run_id: String = row.get(0).map_err(storage)?;
    let workflow_name: String = row.get(1).map_err(storage)?;
    let status: String = row.get(2).map_err(storage)?;
    let started_at: String = row.get(3).map_err(storage)?;
    let completed_at: Option<String> = row.get(4).map_err(storage)?;
    let inputs: String = row.get(5).map_err(storage)?;
    let outputs: String = row.get(6).map_err(storage)?;
    let config_snapshot: String = row.get(7).map_err(storage)?;
    let agent_id: Option<String> = row.get(8).map_err(storage)?;
    let parent_run_id: Option<String> = row.get(9).map_err(storage)?;
    let duration_seconds: Option<f64> = row.get(10).map_err(storage)?;
    let cost_usd: Option<f64> = row.get(11).map_err(storage)?;
    let error: Option<String> = row.get(12).map_err(storage)?;
    let metrics: String = row.get(13).map_err(storage)?;

    Ok(RunRecord {
        run_id: run_id.parse().map_err(storage)?,
        workflow_name,
        status: status.parse::<RunStatus>().map_err(EngineError::Storage)?,
        started_at: parse_time(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_time).transpose()?,
        inputs: serde_json::from_str(&inputs).map_err(storage)?,
        outputs: serde_json::from_str(&outputs).map_err(storage)?,
        config_snapshot,
        agent_id,
        parent_run_id: parent_run_id
            .map(|s| s.parse::<Uuid>().map_err(storage))
            .transpose()?,
        duration_seconds,
        cost_usd,
        error,
        metrics: serde_json::from_str(&metrics).map_err(storage)?,
    })
}

const SELECT_COLUMNS: &str = "run_id, workflow_name, status, started_at, completed_at, inputs, \
     outputs, config_snapshot, agent_id, parent_run_id, duration_seconds, cost_usd, error, metrics";

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn create(&self, record: &RunRecord) -> Result<(), EngineError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO runs (run_id, workflow_name, status, started_at, completed_at, \
                 inputs, outputs, config_snapshot, agent_id, parent_run_id, duration_seconds, \
                 cost_usd, error, metrics) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    record.run_id.to_string(),
                    record.workflow_name,
                    record.status.as_str(),
                    record.started_at.to_rfc3339(),
                    record.completed_at.map(|t| t.to_rfc3339()),
                    serde_json::to_string(&record.inputs).map_err(storage)?,
                    serde_json::to_string(&record.outputs).map_err(storage)?,
                    record.config_snapshot,
                    record.agent_id,
                    record.parent_run_id.map(|id| id.to_string()),
                    record.duration_seconds,
                    record.cost_usd,
                    record.error,
                    serde_json::to_string(&record.metrics).map_err(storage)?,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
        .await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        self.with_conn(move |conn| {
            let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
            let changed = conn
                .execute(
                    "UPDATE runs SET status = ?2, \
                     completed_at = COALESCE(?3, completed_at), \
                     error = COALESCE(?4, error) \
                     WHERE run_id = ?1",
                    params![id.to_string(), status.as_str(), completed_at, error],
                )
                .map_err(storage)?;
            if changed == 0 {
                return Err(EngineError::RunNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn append_outputs(
        &self,
        id: Uuid,
        partial: &BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        let partial = partial.clone();
        self.with_conn(move |conn| {
            let current: String = conn
                .query_row(
                    "SELECT outputs FROM runs WHERE run_id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .map_err(|_| EngineError::RunNotFound(id))?;
            let mut outputs: Value = serde_json::from_str(&current).map_err(storage)?;
            if let Value::Object(map) = &mut outputs {
                for (k, v) in partial {
                    map.insert(k, v);
                }
            }
            conn.execute(
                "UPDATE runs SET outputs = ?2 WHERE run_id = ?1",
                params![
                    id.to_string(),
                    serde_json::to_string(&outputs).map_err(storage)?
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
        .await
    }

    async fn update_completion(
        &self,
        id: Uuid,
        outputs: &Value,
        metrics: &BTreeMap<String, f64>,
        duration_seconds: f64,
        cost_usd: f64,
    ) -> Result<(), EngineError> {
        let outputs = outputs.clone();
        let metrics = metrics.clone();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE runs SET outputs = ?2, metrics = ?3, duration_seconds = ?4, \
                     cost_usd = ?5 WHERE run_id = ?1",
                    params![
                        id.to_string(),
                        serde_json::to_string(&outputs).map_err(storage)?,
                        serde_json::to_string(&metrics).map_err(storage)?,
                        duration_seconds,
                        cost_usd,
                    ],
                )
                .map_err(storage)?;
            if changed == 0 {
                return Err(EngineError::RunNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, EngineError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM runs WHERE run_id = ?1",
                    SELECT_COLUMNS
                ))
                .map_err(storage)?;
            let mut rows = stmt.query(params![id.to_string()]).map_err(storage)?;
            match rows.next().map_err(storage)? {
                Some(row) => Ok(Some(row_to_record(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, EngineError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {} FROM runs WHERE 1=1", SELECT_COLUMNS);
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(status) = filter.status {
                args.push(Box::new(status.as_str().to_string()));
                sql.push_str(&format!(" AND status = ?{}", args.len()));
            }
            if let Some(ref workflow) = filter.workflow {
                args.push(Box::new(workflow.clone()));
                sql.push_str(&format!(" AND workflow_name = ?{}", args.len()));
            }
            // RFC 3339 UTC timestamps order lexicographically.
            if let Some(since) = filter.since {
                args.push(Box::new(since.to_rfc3339()));
                sql.push_str(&format!(" AND started_at >= ?{}", args.len()));
            }
            if let Some(until) = filter.until {
                args.push(Box::new(until.to_rfc3339()));
                sql.push_str(&format!(" AND started_at <= ?{}", args.len()));
            }
            sql.push_str(" ORDER BY started_at DESC");
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }

            let mut stmt = conn.prepare(&sql).map_err(storage)?;
            let mut rows = stmt
                .query(rusqlite::params_from_iter(args.iter()))
                .map_err(storage)?;
            let mut records = Vec::new();
            while let Some(row) = rows.next().map_err(storage)? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    async fn list_by_agent(&self, agent_id: &str) -> Result<Vec<RunRecord>, EngineError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM runs WHERE agent_id = ?1 ORDER BY started_at DESC",
                    SELECT_COLUMNS
                ))
                .map_err(storage)?;
            let mut rows = stmt.query(params![agent_id]).map_err(storage)?;
            let mut records = Vec::new();
            while let Some(row) = rows.next().map_err(storage)? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }
}
