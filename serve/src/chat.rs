//! Chat UI: one page driving a configured workflow.
//!
//! The page posts `{message}` to `/api/chat`; the handler binds the message
//! to the workflow's first required string input, executes the run inline,
//! and returns the reply field of the final state (`reply`/`response`/
//! `result`/`answer`, else the last field written).

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Html, routing::get, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::Value;

use weft::{
    DefaultLlmFactory, Engine, EngineError, Plan, RunOptions, SqliteRunRepository, State as FlowState,
    ToolRegistry,
};

use crate::catalog::WorkflowCatalog;
use crate::error::{ApiError, ApiResult};
use crate::ChatConfig;

pub struct ChatState {
    pub engine: Arc<Engine>,
    pub plan: Option<Plan>,
}

/// `GET /health` for both services; readiness for the supervisor and the
/// agent protocol alike.
pub async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn build_chat_state(
    config: &ChatConfig,
) -> Result<Arc<ChatState>, Box<dyn std::error::Error + Send + Sync>> {
    let repo = Arc::new(SqliteRunRepository::new(&config.db_path)?);
    let engine = Arc::new(Engine::new(
        repo,
        Arc::new(DefaultLlmFactory),
        Arc::new(ToolRegistry::new()),
    ));
    let catalog = WorkflowCatalog::load_dir(std::path::Path::new(&config.workflows_dir));
    let plan = match &config.workflow {
        Some(name) => catalog.get(name).cloned(),
        None => catalog.first().cloned(),
    };
    Ok(Arc::new(ChatState { engine, plan }))
}

pub fn chat_router(state: Arc<ChatState>) -> Router {
    Router::new()
        .route("/", get(chat_page))
        .route("/api/chat", post(chat_message))
        .route("/health", get(health))
        .with_state(state)
}

async fn chat_page(State(state): State<Arc<ChatState>>) -> Html<String> {
    let workflow = state
        .plan
        .as_ref()
        .map(|p| p.name().to_string())
        .unwrap_or_else(|| "no workflow configured".to_string());
    Html(crate::html::page(
        "chat",
        &format!(
            r#"<p>talking to <b>{workflow}</b></p>
<div id="log" style="white-space: pre-wrap; border: 1px solid #ddd; padding: 1rem; min-height: 12rem;"></div>
<form id="f"><input id="m" style="width: 70%" autofocus><button>send</button></form>
<script>
const log = document.getElementById("log");
document.getElementById("f").addEventListener("submit", async (e) => {{
  e.preventDefault();
  const m = document.getElementById("m");
  const message = m.value; m.value = "";
  log.textContent += "\nyou: " + message;
  const res = await fetch("/api/chat", {{
    method: "POST",
    headers: {{"content-type": "application/json"}},
    body: JSON.stringify({{message}}),
  }});
  const data = await res.json();
  log.textContent += "\nweft: " + (data.reply ?? data.error ?? "(no reply)");
}});
</script>"#,
            workflow = crate::html::esc(&workflow),
        ),
    ))
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    message: String,
}

/// Picks the state field that reads as the workflow's reply.
fn reply_field(state: &FlowState) -> Option<&Value> {
    for preferred in ["reply", "response", "result", "answer"] {
        if let Some(value) = state.get(preferred) {
            return Some(value);
        }
    }
    state.values().next_back()
}

async fn chat_message(
    State(state): State<Arc<ChatState>>,
    Json(body): Json<ChatBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Some(plan) = state.plan.as_ref() else {
        return Err(ApiError(EngineError::WorkflowNotFound(
            "no chat workflow configured".to_string(),
        )));
    };

    // Bind the message to the first required string field.
    let field = plan
        .state_model
        .fields()
        .iter()
        .find(|f| f.required)
        .map(|f| f.name.clone())
        .unwrap_or_else(|| "message".to_string());
    let inputs = [(field, Value::String(body.message))].into_iter().collect();

    let record = state
        .engine
        .execute(plan, inputs, RunOptions::default())
        .await?;

    let outputs: FlowState = match &record.outputs {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => FlowState::new(),
    };
    let reply = match record.status {
        weft::RunStatus::Completed => reply_field(&outputs)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "(no reply)".to_string()),
        _ => format!(
            "run {}: {}",
            record.status,
            record.error.as_deref().unwrap_or("no detail")
        ),
    };
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "run_id": record.run_id, "reply": reply })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_field_prefers_conventional_names() {
        let mut state = FlowState::new();
        state.insert("article".into(), json!("long"));
        state.insert("reply".into(), json!("short"));
        assert_eq!(reply_field(&state), Some(&json!("short")));

        let mut anon = FlowState::new();
        anon.insert("alpha".into(), json!(1));
        anon.insert("zeta".into(), json!(2));
        assert_eq!(reply_field(&anon), Some(&json!(2)));
    }
}
