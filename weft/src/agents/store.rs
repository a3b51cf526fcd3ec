//! Agent record storage: in-process map and the shared SQLite table.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, Row};

use super::AgentRecord;
use crate::error::EngineError;

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn upsert(&self, record: &AgentRecord) -> Result<(), EngineError>;

    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, EngineError>;

    /// Sets `last_heartbeat`; returns false when the agent is unknown.
    async fn touch_heartbeat(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError>;

    /// Returns false when the agent is unknown.
    async fn remove(&self, agent_id: &str) -> Result<bool, EngineError>;

    async fn list(&self) -> Result<Vec<AgentRecord>, EngineError>;
}

#[derive(Default)]
pub struct MemoryAgentStore {
    records: DashMap<String, AgentRecord>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn upsert(&self, record: &AgentRecord) -> Result<(), EngineError> {
        self.records.insert(record.agent_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, EngineError> {
        Ok(self.records.get(agent_id).map(|r| r.clone()))
    }

    async fn touch_heartbeat(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        match self.records.get_mut(agent_id) {
            Some(mut record) => {
                record.last_heartbeat = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, agent_id: &str) -> Result<bool, EngineError> {
        Ok(self.records.remove(agent_id).is_some())
    }

    async fn list(&self) -> Result<Vec<AgentRecord>, EngineError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}

/// Agents table in the shared relational store. Same open-per-call pattern as
/// the run repository; heartbeats are last-write-wins single-row updates.
pub struct SqliteAgentStore {
    db_path: PathBuf,
}

fn storage(e: impl std::fmt::Display) -> EngineError {
    EngineError::Storage(e.to_string())
}

impl SqliteAgentStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path).map_err(storage)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                metadata TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                ttl_seconds INTEGER NOT NULL
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

fn row_to_record(row: &Row<'_>) -> Result<AgentRecord, EngineError> {
    let metadata: String = row.get(3).map_err(storage)?;
    let capabilities: String = row.get(4).map_err(storage)?;
    let registered_at: String = row.get(5).map_err(storage)?;
    let last_heartbeat: String = row.get(6).map_err(storage)?;
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(storage)
    };
    Ok(AgentRecord {
        agent_id: row.get(0).map_err(storage)?,
        name: row.get(1).map_err(storage)?,
        url: row.get(2).map_err(storage)?,
        metadata: serde_json::from_str(&metadata).map_err(storage)?,
        capabilities: serde_json::from_str(&capabilities).map_err(storage)?,
        registered_at: parse(&registered_at)?,
        last_heartbeat: parse(&last_heartbeat)?,
        ttl_seconds: row.get::<_, i64>(7).map_err(storage)? as u64,
    })
}

const COLUMNS: &str =
    "agent_id, name, url, metadata, capabilities, registered_at, last_heartbeat, ttl_seconds";

#[async_trait]
impl AgentStore for SqliteAgentStore {
    async fn upsert(&self, record: &AgentRecord) -> Result<(), EngineError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agents (agent_id, name, url, metadata, capabilities, \
                 registered_at, last_heartbeat, ttl_seconds) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(agent_id) DO UPDATE SET \
                 name = excluded.name, url = excluded.url, metadata = excluded.metadata, \
                 capabilities = excluded.capabilities, registered_at = excluded.registered_at, \
                 last_heartbeat = excluded.last_heartbeat, ttl_seconds = excluded.ttl_seconds",
                params![
                    record.agent_id,
                    record.name,
                    record.url,
                    serde_json::to_string(&record.metadata).map_err(storage)?,
                    serde_json::to_string(&record.capabilities).map_err(storage)?,
                    record.registered_at.to_rfc3339(),
                    record.last_heartbeat.to_rfc3339(),
                    record.ttl_seconds as i64,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, EngineError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM agents WHERE agent_id = ?1",
                    COLUMNS
                ))
                .map_err(storage)?;
            let mut rows = stmt.query(params![agent_id]).map_err(storage)?;
            match rows.next().map_err(storage)? {
                Some(row) => Ok(Some(row_to_record(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn touch_heartbeat(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE agents SET last_heartbeat = ?2 WHERE agent_id = ?1",
                    params![agent_id, now.to_rfc3339()],
                )
                .map_err(storage)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn remove(&self, agent_id: &str) -> Result<bool, EngineError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute("DELETE FROM agents WHERE agent_id = ?1", params![agent_id])
                .map_err(storage)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<AgentRecord>, EngineError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM agents ORDER BY agent_id", COLUMNS))
                .map_err(storage)?;
            let mut rows = stmt.query([]).map_err(storage)?;
            let mut records = Vec::new();
            while let Some(row) = rows.next().map_err(storage)? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> AgentRecord {
        let now = Utc::now();
        AgentRecord {
            agent_id: id.to_string(),
            name: format!("agent {}", id),
            url: "http://localhost:7001".to_string(),
            metadata: json!({"zone": "eu"}),
            capabilities: vec!["run".to_string(), "schema".to_string()],
            registered_at: now,
            last_heartbeat: now,
            ttl_seconds: 60,
        }
    }

    #[tokio::test]
    async fn sqlite_round_trip_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteAgentStore::new(dir.path().join("agents.db")).unwrap();

        store.upsert(&record("a")).await.unwrap();
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.metadata, json!({"zone": "eu"}));
        assert_eq!(stored.capabilities, vec!["run", "schema"]);

        let mut renamed = record("a");
        renamed.name = "renamed".to_string();
        store.upsert(&renamed).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().name, "renamed");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sqlite_heartbeat_and_remove_report_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteAgentStore::new(dir.path().join("agents.db")).unwrap();

        assert!(!store.touch_heartbeat("ghost", Utc::now()).await.unwrap());
        store.upsert(&record("a")).await.unwrap();
        let later = Utc::now() + chrono::TimeDelta::seconds(10);
        assert!(store.touch_heartbeat("a", later).await.unwrap());
        let stored = store.get("a").await.unwrap().unwrap();
        assert!(stored.last_heartbeat > stored.registered_at);

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
    }
}
