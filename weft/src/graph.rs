//! Plan building and the run engine.
//!
//! [`build_plan`] validates a declaration and synthesizes the runtime models;
//! [`Engine`] drives a plan node by node: record lifecycle through the run
//! repository, per-node metrics, a cooperative cancellation flag checked
//! between nodes (an in-flight LLM call finishes or times out first), and
//! restart from a stored config snapshot as a new run linked by
//! `parent_run_id`.
//!
//! One run executes sequentially; concurrency lives across runs, not inside
//! them.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::exec::NodeRun;
use crate::llm::{EffectiveLlm, LlmFactory};
use crate::runs::{RunRecord, RunRepository, RunStatus};
use crate::schema::{validate::validate, Declaration, NodeSpec, START};
use crate::state::{OutputModel, StateModel};
use crate::tools::ToolRegistry;

/// Default whole-node timeout when neither the node nor the execution
/// defaults set one.
const DEFAULT_NODE_TIMEOUT_SECS: u64 = 120;

/// Default retries after the first attempt.
const DEFAULT_NODE_RETRY: u32 = 1;

/// A validated, in-memory representation of a declaration, ready to execute
/// and reusable across runs.
#[derive(Debug, Clone)]
pub struct Plan {
    pub decl: Declaration,
    /// Canonical JSON of `decl`; stored on every run as `config_snapshot`.
    pub snapshot: String,
    /// Node ids in execution order.
    pub order: Vec<String>,
    pub state_model: StateModel,
    output_models: HashMap<String, OutputModel>,
}

/// Validates and materializes a declaration.
pub fn build_plan(decl: Declaration) -> Result<Plan, EngineError> {
    validate(&decl)?;
    let state_model = StateModel::from_decl(&decl.state)?;

    let mut output_models = HashMap::new();
    for node in &decl.nodes {
        output_models.insert(node.id.clone(), OutputModel::from_node(node, &state_model)?);
        // Fail fast on an unresolvable model selection.
        effective_llm(&decl, node)?;
    }

    // Validation guarantees a single linear chain from START; walk it.
    let next: HashMap<&str, &str> = decl
        .edges
        .iter()
        .filter_map(|e| e.to.as_deref().map(|to| (e.from.as_str(), to)))
        .collect();
    let mut order = Vec::with_capacity(decl.nodes.len());
    let mut current = next.get(START).copied();
    while let Some(id) = current {
        if id == crate::schema::END {
            break;
        }
        order.push(id.to_string());
        current = next.get(id).copied();
    }

    let snapshot =
        serde_json::to_string(&decl).map_err(|e| EngineError::ConfigParse(e.to_string()))?;
    Ok(Plan {
        decl,
        snapshot,
        order,
        state_model,
        output_models,
    })
}

impl Plan {
    pub fn from_yaml_str(source: &str) -> Result<Self, EngineError> {
        build_plan(Declaration::from_yaml_str(source)?)
    }

    pub fn from_json_str(source: &str) -> Result<Self, EngineError> {
        build_plan(Declaration::from_json_str(source)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let (decl, _source) = Declaration::load(path)?;
        build_plan(decl)
    }

    pub fn name(&self) -> &str {
        &self.decl.flow.name
    }

    pub fn output_model(&self, node_id: &str) -> &OutputModel {
        &self.output_models[node_id]
    }
}

fn effective_llm(decl: &Declaration, node: &NodeSpec) -> Result<EffectiveLlm, EngineError> {
    let defaults = decl.config.as_ref().and_then(|c| c.llm_defaults.as_ref());
    EffectiveLlm::merge(node.llm.as_ref(), defaults)
        .map_err(|e| EngineError::validation(format!("nodes.{}.llm", node.id), e))
}

fn retry_for(decl: &Declaration, node: &NodeSpec) -> u32 {
    node.retry
        .or_else(|| {
            decl.config
                .as_ref()
                .and_then(|c| c.execution_defaults.as_ref())
                .and_then(|d| d.retry)
        })
        .unwrap_or(DEFAULT_NODE_RETRY)
}

fn timeout_for(decl: &Declaration, node: &NodeSpec) -> Duration {
    let seconds = node
        .timeout
        .or_else(|| {
            decl.config
                .as_ref()
                .and_then(|c| c.execution_defaults.as_ref())
                .and_then(|d| d.timeout)
        })
        .unwrap_or(DEFAULT_NODE_TIMEOUT_SECS);
    Duration::from_secs(seconds)
}

/// Lineage and attribution for a new run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub agent_id: Option<String>,
    pub parent_run_id: Option<Uuid>,
}

/// The run orchestrator: owns the repository, the model factory, the tool
/// catalog, and the live cancellation flags.
pub struct Engine {
    repo: Arc<dyn RunRepository>,
    llms: Arc<dyn LlmFactory>,
    tools: Arc<ToolRegistry>,
    active: DashMap<Uuid, Arc<AtomicBool>>,
}

impl Engine {
    pub fn new(
        repo: Arc<dyn RunRepository>,
        llms: Arc<dyn LlmFactory>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            repo,
            llms,
            tools,
            active: DashMap::new(),
        }
    }

    pub fn repo(&self) -> Arc<dyn RunRepository> {
        self.repo.clone()
    }

    /// Executes a plan to completion. Node failure is a run outcome, not an
    /// `Err`: the returned record carries `failed` plus the error text. `Err`
    /// is reserved for infrastructure problems (storage, bad inputs).
    pub async fn execute(
        &self,
        plan: &Plan,
        inputs: BTreeMap<String, Value>,
        opts: RunOptions,
    ) -> Result<RunRecord, EngineError> {
        let record = self.prepare(plan, inputs, opts).await?;
        self.drive(plan, record).await
    }

    /// Creates the `pending` record, then drives the run on a spawned task.
    /// Returns the run id immediately plus the join handle (webhook and
    /// restart paths hold it to scope worker-pool permits).
    pub async fn start_detached(
        self: &Arc<Self>,
        plan: Plan,
        inputs: BTreeMap<String, Value>,
        opts: RunOptions,
    ) -> Result<(Uuid, JoinHandle<()>), EngineError> {
        let record = self.prepare(&plan, inputs, opts).await?;
        let run_id = record.run_id;
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.drive(&plan, record).await {
                error!(run_id = %run_id, error = %e, "detached run failed to persist");
            }
        });
        Ok((run_id, handle))
    }

    /// Requests cancellation. Returns false when the run is not live in this
    /// process — cancellation is cooperative and process-local.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Re-materializes a finished run's config snapshot into a new run,
    /// linked by `parent_run_id`. The original record is never touched.
    pub async fn restart(
        self: &Arc<Self>,
        run_id: Uuid,
    ) -> Result<(Uuid, JoinHandle<()>), EngineError> {
        let record = self
            .repo
            .get(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if !record.status.is_terminal() {
            return Err(EngineError::validation(
                "run",
                format!("run {} is still {}", run_id, record.status),
            ));
        }
        let plan = Plan::from_json_str(&record.config_snapshot)?;
        let inputs = value_to_inputs(&record.inputs);
        self.start_detached(
            plan,
            inputs,
            RunOptions {
                agent_id: None,
                parent_run_id: Some(run_id),
            },
        )
        .await
    }

    async fn prepare(
        &self,
        plan: &Plan,
        inputs: BTreeMap<String, Value>,
        opts: RunOptions,
    ) -> Result<RunRecord, EngineError> {
        // Reject bad inputs before anything is persisted.
        plan.state_model.make_state(&inputs)?;
        let mut record = RunRecord::new(
            plan.name(),
            Value::Object(inputs.into_iter().collect()),
            plan.snapshot.clone(),
        );
        record.agent_id = opts.agent_id;
        record.parent_run_id = opts.parent_run_id;
        self.repo.create(&record).await?;
        self.active
            .insert(record.run_id, Arc::new(AtomicBool::new(false)));
        Ok(record)
    }

    async fn drive(&self, plan: &Plan, record: RunRecord) -> Result<RunRecord, EngineError> {
        let run_id = record.run_id;
        let flag = self
            .active
            .get(&run_id)
            .map(|f| f.clone())
            .unwrap_or_default();
        let result = self.drive_inner(plan, record, &flag).await;
        self.active.remove(&run_id);
        result
    }

    async fn drive_inner(
        &self,
        plan: &Plan,
        record: RunRecord,
        cancel: &AtomicBool,
    ) -> Result<RunRecord, EngineError> {
        let run_id = record.run_id;
        let started = std::time::Instant::now();
        let inputs = value_to_inputs(&record.inputs);

        if cancel.load(Ordering::Relaxed) {
            return self.finish(run_id, RunStatus::Cancelled, None).await;
        }
        self.repo
            .update_status(run_id, RunStatus::Running, None)
            .await?;
        info!(run_id = %run_id, workflow = plan.name(), "run started");

        let mut state = plan.state_model.make_state(&inputs)?;
        let mut metrics: BTreeMap<String, f64> = BTreeMap::new();
        let mut total_cost = 0.0;
        let mut block_deploy = false;

        for node_id in &plan.order {
            if cancel.load(Ordering::Relaxed) {
                info!(run_id = %run_id, node = %node_id, "cancelled before node");
                return self.finish(run_id, RunStatus::Cancelled, None).await;
            }

            let node = plan
                .decl
                .node(node_id)
                .expect("plan order references declared nodes");
            let llm = effective_llm(&plan.decl, node)?;
            let client = match self.llms.client(&llm) {
                Ok(client) => client,
                Err(e) => {
                    return self
                        .fail(run_id, node_id, EngineError::Llm(e), started)
                        .await
                }
            };
            let node_run = NodeRun {
                node,
                output_model: plan.output_model(node_id),
                client,
                llm: &llm,
                tools: &self.tools,
                gates: plan.decl.gates(),
                retry: retry_for(&plan.decl, node),
                timeout: timeout_for(&plan.decl, node),
            };

            match node_run.execute(&inputs, &state).await {
                Ok(outcome) => {
                    state = outcome.state;
                    block_deploy |= outcome.block_deploy;
                    total_cost += outcome.metrics.cost_usd;
                    for (key, value) in outcome.metrics.as_map() {
                        metrics.insert(format!("{}.{}", node_id, key), value);
                    }
                    self.repo.append_outputs(run_id, &outcome.outputs).await?;
                }
                Err(e) => return self.fail(run_id, node_id, e, started).await,
            }
        }

        let duration = started.elapsed().as_secs_f64();
        metrics.insert("cost_usd".to_string(), total_cost);
        metrics.insert("duration_seconds".to_string(), duration);
        if block_deploy {
            metrics.insert("block_deploy".to_string(), 1.0);
        }

        let outputs = Value::Object(state.into_iter().collect());
        self.repo
            .update_completion(run_id, &outputs, &metrics, duration, total_cost)
            .await?;
        let finished = self.finish(run_id, RunStatus::Completed, None).await?;
        info!(run_id = %run_id, cost_usd = total_cost, duration_seconds = duration, "run completed");
        self.export(plan, &finished);
        Ok(finished)
    }

    async fn fail(
        &self,
        run_id: Uuid,
        node_id: &str,
        e: EngineError,
        started: std::time::Instant,
    ) -> Result<RunRecord, EngineError> {
        warn!(run_id = %run_id, node = node_id, error = %e, "node failed; run failed");
        let duration = started.elapsed().as_secs_f64();
        let metrics: BTreeMap<String, f64> =
            [("duration_seconds".to_string(), duration)].into_iter().collect();
        // Record duration without clobbering partial outputs already appended.
        if let Ok(Some(current)) = self.repo.get(run_id).await {
            self.repo
                .update_completion(run_id, &current.outputs, &metrics, duration, 0.0)
                .await
                .ok();
        }
        self.finish(
            run_id,
            RunStatus::Failed,
            Some(format!("node `{}`: {}", node_id, e)),
        )
        .await
    }

    async fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<RunRecord, EngineError> {
        self.repo.update_status(run_id, status, error).await?;
        self.repo
            .get(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Appends one JSON line per finished run when observability export is
    /// configured. Best effort: export problems are logged, never fatal.
    fn export(&self, plan: &Plan, record: &RunRecord) {
        let Some(path) = plan
            .decl
            .config
            .as_ref()
            .and_then(|c| c.observability.as_ref())
            .and_then(|o| o.export_path.clone())
        else {
            return;
        };
        let line = serde_json::json!({
            "run_id": record.run_id,
            "workflow": record.workflow_name,
            "status": record.status,
            "duration_seconds": record.duration_seconds,
            "cost_usd": record.cost_usd,
            "metrics": record.metrics,
        });
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                use std::io::Write;
                writeln!(f, "{}", line)
            });
        if let Err(e) = result {
            warn!(path = %path, error = %e, "observability export failed");
        }
    }
}

fn value_to_inputs(value: &Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{EchoLlm, MockLlm, SingleClientFactory};
    use crate::runs::memory::MemoryRunRepository;
    use serde_json::json;

    const ECHO: &str = r#"
schema_version: "1.0"
flow: { name: echo }
state:
  fields:
    message: { type: str, required: true }
    result: { type: str }
nodes:
  - id: echo
    prompt: "Echo: {message}"
    llm: { provider: echo, model: echo-1 }
    outputs: [result]
edges:
  - { from: START, to: echo }
  - { from: echo, to: END }
"#;

    fn engine_with(client: Arc<dyn crate::llm::LlmClient>) -> Arc<Engine> {
        Arc::new(Engine::new(
            Arc::new(MemoryRunRepository::new()),
            Arc::new(SingleClientFactory(client)),
            Arc::new(ToolRegistry::new()),
        ))
    }

    #[test]
    fn plan_orders_nodes_topologically() {
        let plan = Plan::from_yaml_str(ECHO).unwrap();
        assert_eq!(plan.order, vec!["echo"]);
        assert_eq!(plan.name(), "echo");
    }

    #[test]
    fn plan_requires_a_model_selection() {
        let source = ECHO.replace("    llm: { provider: echo, model: echo-1 }\n", "");
        let err = Plan::from_yaml_str(&source).unwrap_err();
        assert!(err.to_string().contains("no model selected"), "{}", err);
    }

    #[tokio::test]
    async fn echo_run_completes_with_outputs() {
        let engine = engine_with(Arc::new(EchoLlm));
        let plan = Plan::from_yaml_str(ECHO).unwrap();
        let inputs = [("message".to_string(), json!("hi"))].into_iter().collect();
        let record = engine
            .execute(&plan, inputs, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.outputs["result"], json!("Echo: hi"));
        assert!(record.duration_seconds.unwrap() >= 0.0);
        assert!(record.started_at <= record.completed_at.unwrap());
    }

    #[tokio::test]
    async fn node_failure_yields_failed_record_with_node_id() {
        let client = Arc::new(MockLlm::new(vec![
            Err(crate::llm::LlmError::Auth("no key".into())),
        ]));
        let engine = engine_with(client);
        let plan = Plan::from_yaml_str(ECHO).unwrap();
        let inputs = [("message".to_string(), json!("hi"))].into_iter().collect();
        let record = engine
            .execute(&plan, inputs, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        let error = record.error.unwrap();
        assert!(error.contains("node `echo`"), "{}", error);
        assert!(error.contains("authentication failed"), "{}", error);
    }

    #[tokio::test]
    async fn missing_required_input_is_an_error_not_a_run() {
        let engine = engine_with(Arc::new(EchoLlm));
        let plan = Plan::from_yaml_str(ECHO).unwrap();
        let err = engine
            .execute(&plan, BTreeMap::new(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TypeValidation { .. }));
        // Nothing was persisted.
        assert!(engine
            .repo()
            .list(&crate::runs::RunFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn restart_links_parent_and_preserves_snapshot() {
        let engine = engine_with(Arc::new(EchoLlm));
        let plan = Plan::from_yaml_str(ECHO).unwrap();
        let inputs = [("message".to_string(), json!("hi"))].into_iter().collect();
        let original = engine
            .execute(&plan, inputs, RunOptions::default())
            .await
            .unwrap();

        let (new_id, handle) = engine.restart(original.run_id).await.unwrap();
        handle.await.unwrap();
        assert_ne!(new_id, original.run_id);

        let restarted = engine.repo().get(new_id).await.unwrap().unwrap();
        assert_eq!(restarted.parent_run_id, Some(original.run_id));
        assert_eq!(restarted.config_snapshot, original.config_snapshot);
        assert_eq!(restarted.status, RunStatus::Completed);

        let untouched = engine.repo().get(original.run_id).await.unwrap().unwrap();
        assert_eq!(untouched, original);
    }

    #[tokio::test]
    async fn restart_of_active_run_is_rejected() {
        let engine = engine_with(Arc::new(EchoLlm));
        let plan = Plan::from_yaml_str(ECHO).unwrap();
        let record = RunRecord::new("echo", json!({}), plan.snapshot.clone());
        engine.repo().create(&record).await.unwrap();
        engine
            .repo()
            .update_status(record.run_id, RunStatus::Running, None)
            .await
            .unwrap();
        let err = engine.restart(record.run_id).await.unwrap_err();
        assert!(err.to_string().contains("still running"), "{}", err);
    }

    #[tokio::test]
    async fn cancellation_between_nodes_stops_the_run() {
        // Two nodes; a slow client gives us time to cancel between them.
        const TWO: &str = r#"
schema_version: "1.0"
flow: { name: two }
state:
  fields:
    topic: { type: str, required: true }
    a: { type: str }
    b: { type: str }
nodes:
  - id: first
    prompt: "One {topic}"
    llm: { provider: echo, model: echo-1 }
    outputs: [a]
  - id: second
    prompt: "Two {a}"
    llm: { provider: echo, model: echo-1 }
    outputs: [b]
edges:
  - { from: START, to: first }
  - { from: first, to: second }
  - { from: second, to: END }
"#;
        struct Slow;
        #[async_trait::async_trait]
        impl crate::llm::LlmClient for Slow {
            async fn invoke(
                &self,
                request: &crate::llm::LlmRequest,
            ) -> Result<crate::llm::LlmReply, crate::llm::LlmError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                EchoLlm.invoke(request).await
            }
        }
        let engine = engine_with(Arc::new(Slow));
        let plan = Plan::from_yaml_str(TWO).unwrap();
        let inputs = [("topic".to_string(), json!("x"))].into_iter().collect();
        let (run_id, handle) = engine
            .start_detached(plan, inputs, RunOptions::default())
            .await
            .unwrap();

        // Let the first node start, then cancel.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(engine.cancel(run_id));
        handle.await.unwrap();

        let record = engine.repo().get(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
        // The first node's output may be present; the second never started.
        assert!(record.outputs.get("b").is_none());
    }

    #[tokio::test]
    async fn two_node_run_threads_state_through() {
        const TWO: &str = r#"
schema_version: "1.0"
flow: { name: research-write }
state:
  fields:
    topic: { type: str, required: true }
    research: { type: str }
    article: { type: str }
nodes:
  - id: research
    prompt: "Research {topic}"
    llm: { provider: echo, model: echo-1 }
    outputs: [research]
  - id: write
    prompt: "Write from {research}"
    llm: { provider: echo, model: echo-1 }
    outputs: [article]
edges:
  - { from: START, to: research }
  - { from: research, to: write }
  - { from: write, to: END }
"#;
        let engine = engine_with(Arc::new(EchoLlm));
        let plan = Plan::from_yaml_str(TWO).unwrap();
        let inputs = [("topic".to_string(), json!("rust"))].into_iter().collect();
        let record = engine
            .execute(&plan, inputs, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.outputs["research"], json!("Research rust"));
        // The second node saw the first node's output in state.
        assert_eq!(record.outputs["article"], json!("Write from Research rust"));
        assert!(record.metrics.contains_key("research.duration_ms"));
        assert!(record.metrics.contains_key("write.duration_ms"));
    }
}
