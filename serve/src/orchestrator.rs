//! Orchestrator routes: agent membership and remote execution.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, Redirect},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use weft::{AgentSchema, EngineError, RegisterAgent};

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};
use crate::html::{esc, page};

pub async fn agents_page(State(state): State<Arc<AppState>>) -> ApiResult<Html<String>> {
    let agents = state.registry.list(false).await?;
    let body = format!(
        "<p>{count} agent(s)</p>\
         <table><tr><th>agent</th><th>name</th><th>url</th><th>alive</th>\
         <th>last heartbeat</th><th>ttl</th></tr>\
         <tbody id=\"agent-rows\" hx-get=\"/orchestrator/health-check\" \
         hx-trigger=\"every 10s\" hx-swap=\"innerHTML\">{rows}</tbody></table>",
        count = agents.len(),
        rows = agent_rows(&agents),
    );
    Ok(Html(page("agents", &body)))
}

fn agent_rows(agents: &[weft::AgentView]) -> String {
    let mut rows = String::new();
    for view in agents {
        let r = &view.record;
        rows.push_str(&format!(
            "<tr><td>{id}</td><td>{name}</td><td>{url}</td>\
             <td class=\"{class}\">{alive}</td><td>{heartbeat}</td><td>{ttl}s</td></tr>",
            id = esc(&r.agent_id),
            name = esc(&r.name),
            url = esc(&r.url),
            class = if view.alive { "status-completed" } else { "status-failed" },
            alive = if view.alive { "alive" } else { "unavailable" },
            heartbeat = r.last_heartbeat.format("%Y-%m-%d %H:%M:%S"),
            ttl = r.ttl_seconds,
        ));
    }
    rows
}

/// HTMX partial. Swap contract: this endpoint returns only `<tr>` elements
/// and the client swaps them into `#agent-rows` with `innerHTML`; returning
/// a wrapper element here would nest tables on every refresh. `alive` is
/// recomputed from `last_heartbeat` on each request.
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Html<String>> {
    let agents = state.registry.list(false).await?;
    Ok(Html(agent_rows(&agents)))
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub agent_id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// `200` registered; `400` when the agent's health endpoint is unreachable;
/// `409` when the id is already registered.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    match state.registry.get(&body.agent_id).await {
        Ok(_) => {
            return Ok((
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": format!("agent `{}` already registered", body.agent_id)
                })),
            ))
        }
        Err(EngineError::AgentNotFound(_)) => {}
        Err(e) => return Err(ApiError(e)),
    }
    if !state.registry.probe_url(&body.url).await {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("agent at {} did not answer /health", body.url)
            })),
        ));
    }
    let record = state
        .registry
        .register(RegisterAgent {
            agent_id: body.agent_id,
            name: body.name,
            url: body.url,
            metadata: body.metadata,
            capabilities: body.capabilities,
            ttl_seconds: body.ttl_seconds.unwrap_or(60),
        })
        .await?;
    Ok((
        StatusCode::OK,
        Json(serde_json::to_value(record).map_err(|e| EngineError::Storage(e.to_string()))?),
    ))
}

/// `204` removed; `404` unknown.
pub async fn deregister(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.registry.deregister(&agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `204` refreshed; `404` unknown. Heartbeats never create records.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.registry.heartbeat(&agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn schema(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<AgentSchema>> {
    Ok(Json(state.orchestrator.fetch_schema(&agent_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    #[serde(default)]
    pub inputs: Value,
}

/// Dispatches to the remote agent, then redirects (303) to the unified run
/// detail page.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> ApiResult<Redirect> {
    let record = state.orchestrator.execute_on(&agent_id, body.inputs).await?;
    Ok(Redirect::to(&format!("/workflows/{}", record.run_id)))
}
