//! OpenAI Chat Completions provider implementing [`LlmClient`].
//!
//! Uses `OPENAI_API_KEY` from the environment (or an explicit config). Tools
//! are bound to the outgoing request first; the structured-output instruction
//! is imposed afterwards as the final system message — keep that order, some
//! OpenAI-compatible gateways drop tool definitions that arrive after a
//! response-format constraint.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionMessageToolCalls, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage, ChatCompletionTool,
        ChatCompletionToolChoiceOption, ChatCompletionTools, CreateChatCompletionRequestArgs,
        FunctionObject, ToolChoiceOptions,
    },
    Client,
};

use super::{cost_usd, LlmClient, LlmError, LlmReply, LlmRequest, LlmUsage, ToolCall};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// OpenAI Chat Completions client.
pub struct ChatOpenAI {
    client: Client<OpenAIConfig>,
    model: String,
}

impl ChatOpenAI {
    /// API key from `OPENAI_API_KEY`; base URL from `OPENAI_BASE_URL` when the
    /// default config picks it up.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
        }
    }

    /// Custom config (explicit key or base URL); used by tests.
    pub fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(config),
            model: model.into(),
        }
    }

    fn system_content(request: &LlmRequest) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(ref system) = request.system {
            parts.push(system);
        }
        for hint in &request.hints {
            parts.push(hint);
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

fn map_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::ApiError(api) => {
            let msg = api.to_string();
            let lower = msg.to_lowercase();
            if lower.contains("rate limit") || lower.contains("429") {
                LlmError::RateLimited(msg)
            } else if lower.contains("api key") || lower.contains("authentication") {
                LlmError::Auth(msg)
            } else {
                LlmError::Provider(msg)
            }
        }
        other => LlmError::Provider(other.to_string()),
    }
}

/// Parses a structured reply, tolerating a fenced code block around the JSON.
fn parse_structured(content: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).map_err(|e| {
        LlmError::OutputInvalid(format!(
            "reply is not valid JSON ({}): {}",
            e,
            &body.chars().take(200).collect::<String>()
        ))
    })
}

#[async_trait]
impl LlmClient for ChatOpenAI {
    async fn invoke(&self, request: &LlmRequest) -> Result<LlmReply, LlmError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
        if let Some(system) = Self::system_content(request) {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessage::from(system.as_str()),
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage::from(request.prompt.as_str()),
        ));
        for block in &request.context {
            messages.push(ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessage::from(block.as_str()),
            ));
        }

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone());

        // Tools first. Only after they are on the request may the structured
        // constraint be added.
        if !request.tools.is_empty() {
            let chat_tools: Vec<ChatCompletionTools> = request
                .tools
                .iter()
                .map(|t| {
                    ChatCompletionTools::Function(ChatCompletionTool {
                        function: FunctionObject {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: Some(t.input_schema.clone()),
                            ..Default::default()
                        },
                    })
                })
                .collect();
            args.tools(chat_tools);
            args.tool_choice(ChatCompletionToolChoiceOption::Mode(ToolChoiceOptions::Auto));
        }

        if let Some(ref spec) = request.structured {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessage::from(
                    format!(
                        "Respond with a single JSON object named `{}` matching this JSON Schema, no prose:\n{}",
                        spec.name, spec.schema
                    )
                    .as_str(),
                ),
            ));
        }

        args.messages(messages);
        if let Some(t) = request.temperature {
            args.temperature(t);
        }
        if let Some(m) = request.max_tokens {
            args.max_tokens(m);
        }

        let chat_request = args
            .build()
            .map_err(|e| LlmError::Provider(format!("request build failed: {}", e)))?;

        debug!(
            model = %self.model,
            tools = request.tools.len(),
            structured = request.structured.is_some(),
            "chat completions create"
        );
        trace!(request = ?chat_request, "request body");

        let timeout = request.timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        let response = tokio::time::timeout(timeout, self.client.chat().create(chat_request))
            .await
            .map_err(|_| LlmError::Timeout(timeout))?
            .map_err(map_error)?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| {
                let cost = cost_usd(&self.model, u.prompt_tokens, u.completion_tokens);
                LlmUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                    cost_usd: cost,
                }
            })
            .unwrap_or_default();

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Provider("no choices in response".to_string()))?;
        let message = choice.message;
        let content = message.content.unwrap_or_default();

        let tool_calls: Vec<ToolCall> = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tc| {
                if let ChatCompletionMessageToolCalls::Function(f) = tc {
                    Some(ToolCall {
                        id: Some(f.id),
                        name: f.function.name,
                        arguments: f.function.arguments,
                    })
                } else {
                    None
                }
            })
            .collect();

        let value = match (&request.structured, tool_calls.is_empty()) {
            // A tool turn carries no final value yet.
            (_, false) => serde_json::Value::Null,
            (Some(_), true) => parse_structured(&content)?,
            (None, true) => serde_json::Value::String(content),
        };

        Ok(LlmReply {
            value,
            usage,
            tool_calls,
        })
    }
}
