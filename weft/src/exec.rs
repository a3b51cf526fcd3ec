//! Node executor: one node against the live state.
//!
//! Resolves templates, acquires the model/tool/output contract, drives the
//! tool loop, retries recoverable failures with a clarifying schema hint, and
//! merges validated outputs atomically. Node lifecycle is
//! `pending → running → (succeeded | failed)`; what a failure means for the
//! run is the graph executor's decision.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::gates::{evaluate, GateAction, GateHit, GateSpec};
use crate::llm::{EffectiveLlm, LlmClient, LlmError, LlmRequest, StructuredSpec};
use crate::schema::NodeSpec;
use crate::state::{OutputModel, State};
use crate::template;
use crate::tools::ToolRegistry;

/// Tool rounds within one node before the loop is declared stuck.
const MAX_TOOL_ROUNDS: u32 = 4;

/// Base backoff for rate-limited retries; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Accumulated per-node accounting across every attempt and tool round.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub retries: u32,
}

impl NodeMetrics {
    pub fn as_map(&self) -> BTreeMap<String, f64> {
        [
            ("input_tokens", self.input_tokens as f64),
            ("output_tokens", self.output_tokens as f64),
            ("cost_usd", self.cost_usd),
            ("duration_ms", self.duration_ms as f64),
            ("retries", self.retries as f64),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Result of one node: the updated state, what the node wrote, metrics, and
/// any tripped gates.
#[derive(Debug)]
pub struct NodeOutcome {
    pub state: State,
    pub outputs: BTreeMap<String, Value>,
    pub metrics: NodeMetrics,
    pub gate_hits: Vec<GateHit>,
    /// Set when a `block_deploy` gate tripped; the run continues.
    pub block_deploy: bool,
}

/// Everything needed to run one node once.
pub struct NodeRun<'a> {
    pub node: &'a NodeSpec,
    pub output_model: &'a OutputModel,
    pub client: Arc<dyn LlmClient>,
    pub llm: &'a EffectiveLlm,
    pub tools: &'a ToolRegistry,
    pub gates: &'a [GateSpec],
    /// Retries after the first attempt.
    pub retry: u32,
    /// Whole-node timeout.
    pub timeout: Duration,
}

impl NodeRun<'_> {
    /// Drives the node to completion against `state`.
    pub async fn execute(
        &self,
        inputs: &BTreeMap<String, Value>,
        state: &State,
    ) -> Result<NodeOutcome, EngineError> {
        let started = Instant::now();
        let mut metrics = NodeMetrics::default();

        let node = self.node.id.as_str();
        let result = tokio::time::timeout(self.timeout, self.drive(inputs, state, &mut metrics))
            .await
            .map_err(|_| EngineError::NodeTimeout {
                node: node.to_string(),
                seconds: self.timeout.as_secs(),
            })?;
        metrics.duration_ms = started.elapsed().as_millis() as u64;
        let outputs = result?;

        let metric_map = metrics.as_map();
        let gate_hits = evaluate(self.gates, &metric_map);
        let mut block_deploy = false;
        for hit in &gate_hits {
            match hit.action {
                GateAction::Warn => warn!(
                    node,
                    metric = %hit.metric,
                    value = hit.value,
                    limit = hit.limit,
                    "quality gate warning"
                ),
                GateAction::Fail => {
                    return Err(EngineError::GateFailed {
                        metric: hit.metric.clone(),
                        value: hit.value,
                        limit: hit.limit,
                    })
                }
                GateAction::BlockDeploy => block_deploy = true,
            }
        }

        // All fields validated; merge is all-or-nothing.
        let mut new_state = state.clone();
        for (name, value) in &outputs {
            new_state.insert(name.clone(), value.clone());
        }

        debug!(
            node,
            cost_usd = metrics.cost_usd,
            duration_ms = metrics.duration_ms,
            retries = metrics.retries,
            "node succeeded"
        );
        Ok(NodeOutcome {
            state: new_state,
            outputs,
            metrics,
            gate_hits,
            block_deploy,
        })
    }

    /// A single text output without an explicit schema takes the reply
    /// verbatim; everything else goes through structured output.
    fn structured_spec(&self) -> Option<StructuredSpec> {
        let schema = self.output_model.json_schema();
        let names: Vec<&str> = self.output_model.field_names().collect();
        if self.node.output_schema.is_none() {
            if let [field] = names.as_slice() {
                if schema["properties"][*field] == serde_json::json!({"type": "string"}) {
                    return None;
                }
            }
        }
        Some(StructuredSpec {
            name: format!("{}_output", self.node.id),
            schema,
        })
    }

    async fn drive(
        &self,
        inputs: &BTreeMap<String, Value>,
        state: &State,
        metrics: &mut NodeMetrics,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        // Node input bindings shadow run inputs of the same name.
        let mut ctx_inputs = inputs.clone();
        for (name, path) in &self.node.inputs {
            let value = template::resolve_path(path, inputs, state).ok_or_else(|| {
                EngineError::TemplateResolution(format!(
                    "node `{}` input `{}`: path `{}` did not resolve",
                    self.node.id, name, path
                ))
            })?;
            ctx_inputs.insert(name.clone(), value);
        }
        let prompt = template::resolve(&self.node.prompt, &ctx_inputs, state)?;
        let system = self
            .node
            .system
            .as_deref()
            .map(|s| template::resolve(s, &ctx_inputs, state))
            .transpose()?;

        let tool_specs = self.tools.specs_for(&self.node.tools)?;
        let structured = self.structured_spec();

        let mut request = LlmRequest {
            prompt,
            system,
            tools: tool_specs,
            structured,
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
            timeout: self.llm.timeout.map(Duration::from_secs),
            ..Default::default()
        };

        let mut attempt: u32 = 0;
        let mut tool_rounds: u32 = 0;
        loop {
            let reply = match self.client.invoke(&request).await {
                Ok(reply) => reply,
                Err(e) if e.retryable() && attempt < self.retry => {
                    if matches!(e, LlmError::RateLimited(_)) {
                        tokio::time::sleep(RETRY_BACKOFF * 2u32.pow(attempt)).await;
                    }
                    debug!(node = %self.node.id, attempt, error = %e, "retrying llm call");
                    attempt += 1;
                    metrics.retries += 1;
                    continue;
                }
                Err(e) if e.retryable() => {
                    return Err(EngineError::NodeRetryExhausted {
                        node: self.node.id.clone(),
                        attempts: attempt + 1,
                        cause: e.to_string(),
                    })
                }
                Err(e) => return Err(EngineError::Llm(e)),
            };

            metrics.input_tokens += reply.usage.input_tokens as u64;
            metrics.output_tokens += reply.usage.output_tokens as u64;
            metrics.cost_usd += reply.usage.cost_usd;

            if !reply.tool_calls.is_empty() {
                tool_rounds += 1;
                if tool_rounds > MAX_TOOL_ROUNDS {
                    return Err(EngineError::Llm(LlmError::Provider(format!(
                        "tool loop exceeded {} rounds",
                        MAX_TOOL_ROUNDS
                    ))));
                }
                for call in &reply.tool_calls {
                    let args: Value = serde_json::from_str(&call.arguments)
                        .unwrap_or(Value::Object(serde_json::Map::new()));
                    let result = self.tools.call(&call.name, args).await?;
                    request.context.push(format!(
                        "Tool `{}` was called with {} and returned:\n{}",
                        call.name, call.arguments, result
                    ));
                }
                continue;
            }

            match self.output_model.validate_output(&reply.value) {
                Ok(outputs) => return Ok(outputs),
                Err(type_err) if attempt < self.retry => {
                    debug!(node = %self.node.id, attempt, error = %type_err, "output mismatch, retrying");
                    request.hints.push(format!(
                        "The previous reply did not match the expected output. \
                         Respond with a JSON object matching this JSON Schema exactly:\n{}",
                        self.output_model.json_schema()
                    ));
                    attempt += 1;
                    metrics.retries += 1;
                }
                Err(type_err) => {
                    return Err(EngineError::NodeRetryExhausted {
                        node: self.node.id.clone(),
                        attempts: attempt + 1,
                        cause: type_err.to_string(),
                    })
                }
            }
        }
    }
}
