//! Development and test providers: `echo` and a scripted mock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::{EffectiveLlm, LlmClient, LlmError, LlmFactory, LlmReply, LlmRequest, LlmUsage};

/// Deterministic no-network provider: replies with the resolved prompt.
///
/// With a structured output request, string-typed fields carry the prompt and
/// other types get a zero value, so typed workflows stay runnable offline.
#[derive(Debug, Default)]
pub struct EchoLlm;

fn zero_for(schema: &Value) -> Value {
    match schema.get("type").and_then(Value::as_str) {
        Some("integer") | Some("number") => Value::from(0),
        Some("boolean") => Value::Bool(false),
        Some("array") => Value::Array(Vec::new()),
        Some("object") => Value::Object(serde_json::Map::new()),
        _ => Value::Null,
    }
}

#[async_trait]
impl LlmClient for EchoLlm {
    async fn invoke(&self, request: &LlmRequest) -> Result<LlmReply, LlmError> {
        let words = request.prompt.split_whitespace().count() as u32;
        let value = match &request.structured {
            None => Value::String(request.prompt.clone()),
            Some(spec) => {
                let mut out = serde_json::Map::new();
                if let Some(props) = spec.schema.get("properties").and_then(Value::as_object) {
                    for (name, prop) in props {
                        let v = match prop.get("type").and_then(Value::as_str) {
                            Some("string") | None => Value::String(request.prompt.clone()),
                            _ => zero_for(prop),
                        };
                        out.insert(name.clone(), v);
                    }
                }
                Value::Object(out)
            }
        };
        Ok(LlmReply {
            value,
            usage: LlmUsage {
                input_tokens: words,
                output_tokens: words,
                cost_usd: 0.0,
            },
            tool_calls: Vec::new(),
        })
    }
}

/// Scripted provider for tests: pops one canned result per call and records
/// every request it saw.
pub struct MockLlm {
    script: Mutex<VecDeque<Result<Value, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
    cost_per_call: f64,
}

impl MockLlm {
    pub fn new(script: Vec<Result<Value, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            cost_per_call: 0.0,
        }
    }

    /// Fixed per-call cost, for cost-accounting and gate tests.
    pub fn with_cost(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().expect("mock lock").clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn invoke(&self, request: &LlmRequest) -> Result<LlmReply, LlmError> {
        self.requests.lock().expect("mock lock").push(request.clone());
        let next = self
            .script
            .lock()
            .expect("mock lock")
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Provider("mock script exhausted".to_string())));
        next.map(|value| LlmReply {
            value,
            usage: LlmUsage {
                input_tokens: 10,
                output_tokens: 10,
                cost_usd: self.cost_per_call,
            },
            tool_calls: Vec::new(),
        })
    }
}

/// Factory that hands out one shared client regardless of the requested
/// model; the test seam for the engine.
pub struct SingleClientFactory(pub Arc<dyn LlmClient>);

impl LlmFactory for SingleClientFactory {
    fn client(&self, _llm: &EffectiveLlm) -> Result<Arc<dyn LlmClient>, LlmError> {
        Ok(self.0.clone())
    }
}
