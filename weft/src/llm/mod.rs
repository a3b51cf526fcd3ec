//! LLM provider adapter: one `invoke` façade over many vendors.
//!
//! The engine talks to [`LlmClient`] only; concrete providers are `openai`
//! (Chat Completions via async-openai), `echo` (development/test), and
//! whatever tests inject through [`LlmFactory`]. When a request carries both
//! tools and a structured output type, implementations bind the tools to the
//! outgoing request **before** imposing the structured-output constraint;
//! reversing the order silently drops tools on several vendors and is treated
//! as a defect.

mod mock;
mod openai;

pub use mock::{EchoLlm, MockLlm, SingleClientFactory};
pub use openai::ChatOpenAI;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::schema::LlmRef;
use crate::tools::ToolSpec;

/// Structured output contract: a name and the JSON Schema the reply value
/// must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredSpec {
    pub name: String,
    pub schema: Value,
}

/// One complete invocation: prompt plus everything the provider needs.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Prior tool exchanges of this node, rendered as text blocks; appended
    /// after the prompt so the model sees its own tool results.
    pub context: Vec<String>,
    /// Retry hints (e.g. the expected schema after a type mismatch).
    pub hints: Vec<String>,
    pub tools: Vec<ToolSpec>,
    pub structured: Option<StructuredSpec>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Per-call timeout; implementations must not exceed it.
    pub timeout: Option<Duration>,
}

/// Token usage and cost for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LlmUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    /// Raw JSON arguments as the provider returned them.
    pub arguments: String,
}

/// Provider reply: the value (parsed JSON when structured output was
/// requested, a string otherwise), usage, and any tool calls.
#[derive(Debug, Clone, Default)]
pub struct LlmReply {
    pub value: Value,
    pub usage: LlmUsage,
    pub tool_calls: Vec<ToolCall>,
}

/// LLM failure taxonomy. `retryable()` marks the kinds the node executor may
/// retry; a timeout maps straight to node failure and auth errors are fatal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("llm call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("provider error: {0}")]
    Provider(String),
    /// Structured output did not parse or did not match the schema.
    #[error("output invalid: {0}")]
    OutputInvalid(String),
}

impl LlmError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_) | LlmError::Provider(_) | LlmError::OutputInvalid(_)
        )
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, request: &LlmRequest) -> Result<LlmReply, LlmError>;
}

/// Model selection with every default applied; what the factory consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveLlm {
    pub provider: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Per-LLM-call timeout in seconds.
    pub timeout: Option<u64>,
}

impl EffectiveLlm {
    /// Merges a node's selection over the declaration defaults. The model is
    /// the one required piece; everything else falls back or stays unset.
    pub fn merge(node: Option<&LlmRef>, defaults: Option<&LlmRef>) -> Result<Self, String> {
        let pick = |f: fn(&LlmRef) -> Option<String>| {
            node.and_then(f).or_else(|| defaults.and_then(f))
        };
        let provider = pick(|r| r.provider.clone()).unwrap_or_else(|| "openai".to_string());
        let model = pick(|r| r.model.clone()).ok_or("no model selected (set `llm.model` on the node or `config.llm_defaults.model`)")?;
        Ok(Self {
            provider,
            model,
            temperature: node
                .and_then(|r| r.temperature)
                .or_else(|| defaults.and_then(|r| r.temperature)),
            max_tokens: node
                .and_then(|r| r.max_tokens)
                .or_else(|| defaults.and_then(|r| r.max_tokens)),
            timeout: node
                .and_then(|r| r.timeout)
                .or_else(|| defaults.and_then(|r| r.timeout)),
        })
    }
}

/// Builds clients from a resolved model selection. Injectable so tests can
/// script replies.
pub trait LlmFactory: Send + Sync {
    fn client(&self, llm: &EffectiveLlm) -> Result<Arc<dyn LlmClient>, LlmError>;
}

/// Providers `openai` and `echo`; anything else is a provider error.
#[derive(Debug, Default)]
pub struct DefaultLlmFactory;

impl LlmFactory for DefaultLlmFactory {
    fn client(&self, llm: &EffectiveLlm) -> Result<Arc<dyn LlmClient>, LlmError> {
        match llm.provider.as_str() {
            "openai" => Ok(Arc::new(ChatOpenAI::new(&llm.model))),
            "echo" => Ok(Arc::new(EchoLlm::default())),
            other => Err(LlmError::Provider(format!(
                "unknown provider `{}` (available: openai, echo)",
                other
            ))),
        }
    }
}

/// Per-1k-token USD rates, longest-prefix match on the model name. The
/// fallback rate keeps cost accounting monotonic for unknown models.
const PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.000_15, 0.000_60),
    ("gpt-4o", 0.002_50, 0.010_00),
    ("gpt-4.1-mini", 0.000_40, 0.001_60),
    ("gpt-4.1", 0.002_00, 0.008_00),
    ("o3-mini", 0.001_10, 0.004_40),
];

const FALLBACK_RATE: (f64, f64) = (0.001_00, 0.002_00);

/// Estimated cost in USD for one call against `model`.
pub fn cost_usd(model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    let (input_rate, output_rate) = PRICING
        .iter()
        .filter(|(prefix, _, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _, _)| prefix.len())
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(FALLBACK_RATE);
    (input_tokens as f64 / 1000.0) * input_rate + (output_tokens as f64 / 1000.0) * output_rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_node_over_defaults() {
        let node = LlmRef {
            model: Some("gpt-4o".into()),
            temperature: Some(0.9),
            ..Default::default()
        };
        let defaults = LlmRef {
            provider: Some("openai".into()),
            model: Some("gpt-4o-mini".into()),
            temperature: Some(0.1),
            max_tokens: Some(512),
            ..Default::default()
        };
        let eff = EffectiveLlm::merge(Some(&node), Some(&defaults)).unwrap();
        assert_eq!(eff.model, "gpt-4o");
        assert_eq!(eff.temperature, Some(0.9));
        assert_eq!(eff.max_tokens, Some(512));
    }

    #[test]
    fn merge_requires_a_model_somewhere() {
        let err = EffectiveLlm::merge(None, None).unwrap_err();
        assert!(err.contains("no model selected"), "{}", err);
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let eff = EffectiveLlm {
            provider: "acme".into(),
            model: "m".into(),
            temperature: None,
            max_tokens: None,
            timeout: None,
        };
        let err = match DefaultLlmFactory.client(&eff) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, LlmError::Provider(_)));
    }

    #[test]
    fn pricing_prefers_longest_prefix() {
        // gpt-4o-mini must not be billed at gpt-4o rates.
        let mini = cost_usd("gpt-4o-mini", 1000, 1000);
        let full = cost_usd("gpt-4o", 1000, 1000);
        assert!(mini < full);
        assert!((mini - 0.000_75).abs() < 1e-9, "{}", mini);
    }

    #[test]
    fn pricing_falls_back_for_unknown_models() {
        let c = cost_usd("mystery-model", 2000, 500);
        assert!((c - (0.002 + 0.001)).abs() < 1e-9, "{}", c);
    }

    #[test]
    fn retryable_classification() {
        assert!(LlmError::RateLimited("slow down".into()).retryable());
        assert!(LlmError::Provider("hiccup".into()).retryable());
        assert!(LlmError::OutputInvalid("not json".into()).retryable());
        assert!(!LlmError::Auth("bad key".into()).retryable());
        assert!(!LlmError::Timeout(Duration::from_secs(30)).retryable());
    }
}
