//! Optimization views: experiment list, variant comparison, apply-best.
//!
//! The experiment store is an optional collaborator. Read pages render a
//! friendly unavailable view — never a 500 — when the probe failed at
//! startup or a call answers `StoreUnavailable`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::Html,
    Json,
};
use serde::Deserialize;

use weft::EngineError;

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};
use crate::html::{esc, page};

const DEFAULT_METRIC: &str = "cost_usd";

fn unavailable_page(title: &str) -> Html<String> {
    Html(page(
        title,
        "<p>The experiment store is not reachable right now. Runs and agents are \
         unaffected; experiment views will return once the store is back.</p>",
    ))
}

pub async fn experiments_page(State(state): State<Arc<AppState>>) -> ApiResult<Html<String>> {
    if !state.experiments_available {
        return Ok(unavailable_page("experiments"));
    }
    let names = match state.experiments.list_experiments().await {
        Ok(names) => names,
        Err(EngineError::StoreUnavailable(_)) => return Ok(unavailable_page("experiments")),
        Err(e) => return Err(ApiError(e)),
    };
    let mut rows = String::new();
    for name in &names {
        rows.push_str(&format!(
            "<tr><td><a href=\"/optimization/compare?experiment={name}\">{name}</a></td></tr>",
            name = esc(name),
        ));
    }
    let body = format!(
        "<p>{} experiment(s)</p><table><tr><th>experiment</th></tr>{}</table>",
        names.len(),
        rows
    );
    Ok(Html(page("experiments", &body)))
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub experiment: String,
    pub metric: Option<String>,
    /// Rank descending instead of ascending.
    #[serde(default)]
    pub maximize: bool,
}

pub async fn compare_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompareQuery>,
) -> ApiResult<Html<String>> {
    if !state.experiments_available {
        return Ok(unavailable_page("compare"));
    }
    let metric = query.metric.as_deref().unwrap_or(DEFAULT_METRIC);
    let ranked = match state
        .runner
        .evaluate(&query.experiment, metric, !query.maximize)
        .await
    {
        Ok(ranked) => ranked,
        Err(EngineError::StoreUnavailable(_)) => return Ok(unavailable_page("compare")),
        Err(e) => return Err(ApiError(e)),
    };
    let mut rows = String::new();
    for (i, stats) in ranked.iter().enumerate() {
        rows.push_str(&format!(
            "<tr><td>{rank}</td><td>{variant}</td><td>{count}</td>\
             <td>{mean:.6}</td><td>{p50:.6}</td><td>{p90:.6}</td><td>{p95:.6}</td><td>{p99:.6}</td></tr>",
            rank = i + 1,
            variant = esc(&stats.variant_name),
            count = stats.count,
            mean = stats.mean,
            p50 = stats.p50,
            p90 = stats.p90,
            p95 = stats.p95,
            p99 = stats.p99,
        ));
    }
    let body = format!(
        "<p>experiment <b>{exp}</b> on <b>{metric}</b> ({order})</p>\
         <table><tr><th>#</th><th>variant</th><th>runs</th><th>mean</th>\
         <th>p50</th><th>p90</th><th>p95</th><th>p99</th></tr>{rows}</table>",
        exp = esc(&query.experiment),
        metric = esc(metric),
        order = if query.maximize { "higher is better" } else { "lower is better" },
        rows = rows,
    );
    Ok(Html(page("compare", &body)))
}

#[derive(Debug, Deserialize)]
pub struct ApplyBody {
    pub experiment: String,
    pub workflow_path: String,
    pub metric: Option<String>,
    #[serde(default)]
    pub maximize: bool,
}

/// Rewrites the declaration with the winning variant's prompt (after a
/// timestamped backup) and reports the winner.
pub async fn apply(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ApplyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let metric = body.metric.as_deref().unwrap_or(DEFAULT_METRIC);
    let winner = state
        .runner
        .apply_best(
            &body.experiment,
            &PathBuf::from(&body.workflow_path),
            metric,
            !body.maximize,
        )
        .await?;
    Ok(Json(serde_json::json!({
        "experiment": body.experiment,
        "applied_variant": winner.variant_name,
        "metric": metric,
        "mean": winner.mean,
    })))
}
