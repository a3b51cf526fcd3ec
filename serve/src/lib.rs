//! HTTP control plane for Weft (axum).
//!
//! Two services live here, each started from a plain-data config record so a
//! supervisor can spawn them as independent OS processes:
//!
//! * the **dashboard** — run list/detail/cancel/restart pages, orchestrator
//!   routes (register/deregister/heartbeat/health-check/schema/execute),
//!   optimization views, the generic webhook, and `/health`;
//! * the **chat UI** — a single page driving one configured workflow.
//!
//! **Public API**: [`run_dashboard`], [`run_dashboard_on_listener`],
//! [`run_chat`], [`run_chat_on_listener`].

mod app;
mod catalog;
mod chat;
mod error;
mod html;
mod optimization;
mod orchestrator;
mod webhooks;
mod workflows;

pub use app::{build_state, router, AppState};
pub use catalog::WorkflowCatalog;
pub use chat::{chat_router, ChatState};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

/// Everything the dashboard process needs, as plain data. A supervisor
/// serializes this to the child; no live handles cross the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub port: u16,
    pub db_path: String,
    pub experiment_db_path: String,
    pub workflows_dir: String,
    pub webhook_secret: Option<String>,
    pub max_webhook_runs: usize,
}

/// Plain-data config for the chat process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub port: u16,
    pub db_path: String,
    pub workflows_dir: String,
    /// Workflow the chat drives; `None` picks the first in the catalog.
    pub workflow: Option<String>,
}

/// Runs the dashboard on an existing listener (tests bind `127.0.0.1:0` and
/// pass it in).
pub async fn run_dashboard_on_listener(
    listener: TcpListener,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("dashboard listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Builds state from the config record and serves the dashboard until the
/// process exits.
pub async fn run_dashboard(
    config: DashboardConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
    let state = build_state(&config).await?;
    run_dashboard_on_listener(listener, state).await
}

pub async fn run_chat_on_listener(
    listener: TcpListener,
    state: Arc<ChatState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("chat listening on http://{}", addr);
    axum::serve(listener, chat_router(state)).await?;
    Ok(())
}

pub async fn run_chat(
    config: ChatConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
    let state = chat::build_chat_state(&config)?;
    run_chat_on_listener(listener, state).await
}
