//! Weft: a configuration-driven workflow engine for LLM-backed graphs.
//!
//! A workflow is declared in YAML or JSON: typed shared state, nodes (prompt
//! template + model selection + optional tools + expected output schema), and
//! linear edges between `START` and `END`. The engine materializes the
//! declaration into a [`Plan`], drives it node by node with type-checked
//! retries and cost accounting, persists every run, and feeds the
//! control-plane surfaces (dashboard, webhooks, remote agents, A/B
//! experiments) built on top.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weft::{DefaultLlmFactory, Engine, MemoryRunRepository, Plan, RunOptions, ToolRegistry};
//!
//! # async fn run() -> Result<(), weft::EngineError> {
//! let plan = Plan::from_path(std::path::Path::new("flow.yaml"))?;
//! let engine = Engine::new(
//!     Arc::new(MemoryRunRepository::new()),
//!     Arc::new(DefaultLlmFactory),
//!     Arc::new(ToolRegistry::new()),
//! );
//! let inputs = [("topic".to_string(), serde_json::json!("rust"))]
//!     .into_iter()
//!     .collect();
//! let record = engine.execute(&plan, inputs, RunOptions::default()).await?;
//! println!("{}", record.outputs);
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod error;
pub mod exec;
pub mod experiment;
pub mod gates;
pub mod graph;
pub mod llm;
pub mod orchestrator;
pub mod runs;
pub mod schema;
pub mod state;
pub mod suggest;
pub mod template;
pub mod tools;
pub mod typesys;

pub use agents::{store::MemoryAgentStore, store::SqliteAgentStore, AgentRecord, AgentRegistry, AgentView, RegisterAgent};
pub use error::{EngineError, ValidationIssue, ValidationReport};
pub use exec::{NodeMetrics, NodeOutcome};
pub use experiment::{
    AbTestReport, ExperimentRun, ExperimentRunner, ExperimentStore, MemoryExperimentStore,
    SqliteExperimentStore, VariantStats,
};
pub use gates::{GateAction, GateHit, GateSpec};
pub use graph::{build_plan, Engine, Plan, RunOptions};
pub use llm::{
    ChatOpenAI, DefaultLlmFactory, EchoLlm, EffectiveLlm, LlmClient, LlmError, LlmFactory,
    LlmReply, LlmRequest, LlmUsage, MockLlm, SingleClientFactory,
};
pub use orchestrator::{AgentSchema, Orchestrator, RemoteRunReply};
pub use runs::{
    memory::MemoryRunRepository, sqlite::SqliteRunRepository, RunFilter, RunRecord, RunRepository,
    RunStatus,
};
pub use schema::{Declaration, EdgeSpec, FieldSpec, LlmRef, NodeSpec, END, START};
pub use state::{OutputModel, State, StateModel};
pub use tools::{Tool, ToolError, ToolRegistry, ToolSpec};
pub use typesys::{parse_type, validate_value, TypeRef};
