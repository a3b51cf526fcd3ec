//! Workflow catalog: declarations loaded from a directory at startup,
//! addressed by `flow.name`. Webhook triggers and the chat UI resolve
//! workflows here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use weft::Plan;

#[derive(Clone, Default)]
pub struct WorkflowCatalog {
    plans: Arc<HashMap<String, Plan>>,
}

impl WorkflowCatalog {
    /// Loads every `.yaml`/`.yml`/`.json` declaration under `dir`. Files that
    /// fail to parse or validate are skipped with a warning; a missing
    /// directory is an empty catalog.
    pub fn load_dir(dir: &Path) -> Self {
        let mut plans = HashMap::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "no workflow directory; catalog empty");
                return Self::default();
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_decl = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml") | Some("json")
            );
            if !is_decl {
                continue;
            }
            match Plan::from_path(&path) {
                Ok(plan) => {
                    info!(workflow = plan.name(), path = %path.display(), "workflow loaded");
                    plans.insert(plan.name().to_string(), plan);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "declaration skipped"),
            }
        }
        Self {
            plans: Arc::new(plans),
        }
    }

    /// Builds a catalog from already-materialized plans (tests, embedding).
    pub fn from_plans(plans: Vec<Plan>) -> Self {
        Self {
            plans: Arc::new(
                plans
                    .into_iter()
                    .map(|p| (p.name().to_string(), p))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Plan> {
        self.plans.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plans.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn first(&self) -> Option<&Plan> {
        self.names().first().and_then(|name| self.plans.get(*name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOW: &str = r#"
schema_version: "1.0"
flow: { name: hello }
state:
  fields:
    message: { type: str, required: true }
    result: { type: str }
nodes:
  - id: hello
    prompt: "Say hello to {message}"
    llm: { provider: echo, model: echo-1 }
    outputs: [result]
edges:
  - { from: START, to: hello }
  - { from: hello, to: END }
"#;

    #[test]
    fn loads_valid_skips_broken() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.yaml"), FLOW).unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "nodes: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a workflow").unwrap();

        let catalog = WorkflowCatalog::load_dir(dir.path());
        assert_eq!(catalog.names(), vec!["hello"]);
        assert!(catalog.get("hello").is_some());
        assert!(catalog.get("broken").is_none());
    }

    #[test]
    fn missing_dir_is_empty_catalog() {
        let catalog = WorkflowCatalog::load_dir(Path::new("/definitely/not/here"));
        assert!(catalog.names().is_empty());
        assert!(catalog.first().is_none());
    }
}
