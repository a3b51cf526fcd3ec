//! Named callable catalog with signatures.
//!
//! Tools are registered by name and handed to the LLM adapter as part of a
//! node's request; lookup is exact. Missing names surface at node-execution
//! time, not at plan build, so tools can be registered after materialization.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;

/// Tool signature: name, description for the model, and the JSON schema of
/// its arguments.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{0}")]
    Execution(String),
}

/// A single callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within a registry; what nodes reference in `tools`.
    fn name(&self) -> &str;

    fn spec(&self) -> ToolSpec;

    /// Executes with JSON arguments, returning a JSON result.
    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

/// Exact-name tool catalog shared by the engine.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool; an existing tool of the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Resolves the named tools for one node, erroring on the first missing
    /// name.
    pub fn specs_for(&self, names: &[String]) -> Result<Vec<ToolSpec>, EngineError> {
        names
            .iter()
            .map(|name| {
                self.tools
                    .get(name)
                    .map(|t| t.spec())
                    .ok_or_else(|| EngineError::ToolMissing(name.clone()))
            })
            .collect()
    }

    /// Invokes a registered tool by name.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value, EngineError> {
        let tool = self
            .get(name)
            .ok_or_else(|| EngineError::ToolMissing(name.to_string()))?;
        tool.call(args).await.map_err(|e| EngineError::ToolFailure {
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "upper".to_string(),
                description: Some("Uppercases `text`".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"],
                }),
            }
        }

        async fn call(&self, args: Value) -> Result<Value, ToolError> {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidArgs("`text` must be a string".into()))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn register_and_call() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper));
        let out = registry.call("upper", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, json!("HI"));
    }

    #[tokio::test]
    async fn missing_tool_is_an_error_at_call_time() {
        let registry = ToolRegistry::new();
        let err = registry.call("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolMissing(name) if name == "nope"));
    }

    #[test]
    fn specs_for_errors_on_first_missing_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper));
        let err = registry
            .specs_for(&["upper".to_string(), "lower".to_string()])
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolMissing(name) if name == "lower"));
    }

    #[tokio::test]
    async fn tool_failure_carries_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper));
        let err = registry.call("upper", json!({})).await.unwrap_err();
        match err {
            EngineError::ToolFailure { name, message } => {
                assert_eq!(name, "upper");
                assert!(message.contains("`text` must be a string"), "{}", message);
            }
            other => panic!("expected ToolFailure, got {:?}", other),
        }
    }
}
