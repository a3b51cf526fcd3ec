//! Run pages and run control: list, detail, restart, cancel.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Html,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use weft::{EngineError, RunFilter, RunRecord, RunStatus};

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};
use crate::html::{esc, page};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub workflow: Option<String>,
}

const LIST_LIMIT: usize = 200;

pub async fn list_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Html<String>> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            s.parse::<RunStatus>()
                .map_err(|e| ApiError(EngineError::ConfigParse(e)))
        })
        .transpose()?;
    let filter = RunFilter {
        status,
        workflow: query.workflow.clone(),
        limit: Some(LIST_LIMIT),
        ..Default::default()
    };
    let runs = state.engine.repo().list(&filter).await?;

    let mut rows = String::new();
    for run in &runs {
        rows.push_str(&format!(
            "<tr><td><a href=\"/workflows/{id}\">{id}</a></td><td>{wf}</td>\
             <td class=\"status-{status}\">{status}</td><td>{started}</td>\
             <td>{cost}</td><td>{agent}</td></tr>",
            id = run.run_id,
            wf = esc(&run.workflow_name),
            status = run.status,
            started = run.started_at.format("%Y-%m-%d %H:%M:%S"),
            cost = run
                .cost_usd
                .map(|c| format!("${:.4}", c))
                .unwrap_or_else(|| "—".into()),
            agent = run
                .agent_id
                .as_deref()
                .map(esc)
                .unwrap_or_else(|| "local".into()),
        ));
    }
    let body = format!(
        "<p>{count} run(s). Filter: <a href=\"/workflows?status=running\">running</a> \
         <a href=\"/workflows?status=failed\">failed</a> <a href=\"/workflows\">all</a></p>\
         <table><tr><th>run</th><th>workflow</th><th>status</th><th>started</th>\
         <th>cost</th><th>agent</th></tr>{rows}</table>",
        count = runs.len(),
        rows = rows,
    );
    Ok(Html(page("runs", &body)))
}

async fn load_run(state: &AppState, run_id: Uuid) -> Result<RunRecord, ApiError> {
    state
        .engine
        .repo()
        .get(run_id)
        .await?
        .ok_or(ApiError(EngineError::RunNotFound(run_id)))
}

pub async fn detail_page(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Html<String>> {
    let run = load_run(&state, run_id).await?;
    let outputs = serde_json::to_string_pretty(&run.outputs).unwrap_or_default();
    let metrics = serde_json::to_string_pretty(&run.metrics).unwrap_or_default();
    let body = format!(
        "<p><span class=\"badge status-{status}\">{status}</span> workflow <b>{wf}</b></p>\
         {error}\
         <p>started {started}{completed} · duration {duration} · cost {cost}{agent}{parent}</p>\
         <h2>outputs</h2><pre>{outputs}</pre>\
         <h2>metrics</h2><pre>{metrics}</pre>\
         <form method=\"post\" action=\"/workflows/{id}/restart\"><button>restart</button></form>\
         <p><a href=\"/workflows/{id}/json\">raw record</a></p>",
        status = run.status,
        wf = esc(&run.workflow_name),
        error = run
            .error
            .as_deref()
            .map(|e| format!("<p class=\"status-failed\">{}</p>", esc(e)))
            .unwrap_or_default(),
        started = run.started_at.format("%Y-%m-%d %H:%M:%S"),
        completed = run
            .completed_at
            .map(|t| format!(" · finished {}", t.format("%H:%M:%S")))
            .unwrap_or_default(),
        duration = run
            .duration_seconds
            .map(|d| format!("{:.2}s", d))
            .unwrap_or_else(|| "—".into()),
        cost = run
            .cost_usd
            .map(|c| format!("${:.4}", c))
            .unwrap_or_else(|| "—".into()),
        agent = run
            .agent_id
            .as_deref()
            .map(|a| format!(" · agent {}", esc(a)))
            .unwrap_or_default(),
        parent = run
            .parent_run_id
            .map(|p| format!(" · restarted from <a href=\"/workflows/{p}\">{p}</a>"))
            .unwrap_or_default(),
        outputs = esc(&outputs),
        metrics = esc(&metrics),
        id = run.run_id,
    );
    Ok(Html(page(&format!("run {}", run_id), &body)))
}

pub async fn detail_json(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunRecord>> {
    Ok(Json(load_run(&state, run_id).await?))
}

/// `202 {new_run_id}` on success; `404` unknown run; `400` when the run is
/// still active or its snapshot is not a local declaration.
pub async fn restart(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let (new_run_id, _handle) = state.engine.restart(run_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "new_run_id": new_run_id })),
    ))
}

/// `202` when the cancellation flag was set; `404` unknown; `400` when the
/// run is not live in this process.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if state.engine.cancel(run_id) {
        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "run_id": run_id, "cancelling": true })),
        ));
    }
    let run = load_run(&state, run_id).await?;
    Err(ApiError(EngineError::validation(
        "run",
        format!("run {} is {} and not cancellable here", run_id, run.status),
    )))
}
