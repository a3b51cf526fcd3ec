//! Axum app: shared state, router, and state construction from plain-data
//! config.

use std::sync::Arc;

use axum::{
    response::Redirect,
    routing::{delete, get, post},
    Router,
};
use tokio::sync::Semaphore;
use tracing::warn;

use weft::{
    AgentRegistry, DefaultLlmFactory, Engine, ExperimentRunner, ExperimentStore, Orchestrator,
    SqliteAgentStore, SqliteExperimentStore, SqliteRunRepository, ToolRegistry,
};

use crate::catalog::WorkflowCatalog;
use crate::{chat, optimization, orchestrator, webhooks, workflows, DashboardConfig};

pub struct AppState {
    pub engine: Arc<Engine>,
    pub registry: Arc<AgentRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub experiments: Arc<dyn ExperimentStore>,
    /// Probed once at startup; read paths degrade gracefully when false.
    pub experiments_available: bool,
    pub runner: Arc<ExperimentRunner>,
    pub catalog: WorkflowCatalog,
    pub webhook_secret: Option<String>,
    /// Bounds concurrently webhook-triggered runs; saturation answers 503.
    pub webhook_permits: Arc<Semaphore>,
}

/// Builds the full dashboard state from a config record: SQLite-backed
/// stores, default providers, and the workflow catalog off disk.
pub async fn build_state(
    config: &DashboardConfig,
) -> Result<Arc<AppState>, Box<dyn std::error::Error + Send + Sync>> {
    let repo = Arc::new(SqliteRunRepository::new(&config.db_path)?);
    let engine = Arc::new(Engine::new(
        repo.clone(),
        Arc::new(DefaultLlmFactory),
        Arc::new(ToolRegistry::new()),
    ));
    let registry = Arc::new(AgentRegistry::new(Arc::new(SqliteAgentStore::new(
        &config.db_path,
    )?)));
    let orchestrator = Arc::new(Orchestrator::new(registry.clone(), repo));

    // The experiment store is an optional collaborator: probe once, remember.
    let (experiments, experiments_available): (Arc<dyn ExperimentStore>, bool) =
        match SqliteExperimentStore::new(&config.experiment_db_path) {
            Ok(store) => (Arc::new(store), true),
            Err(e) => {
                warn!(error = %e, "experiment store unavailable; dashboard degrades");
                (Arc::new(weft::MemoryExperimentStore::new()), false)
            }
        };
    let runner = Arc::new(ExperimentRunner::new(engine.clone(), experiments.clone()));

    let catalog = WorkflowCatalog::load_dir(std::path::Path::new(&config.workflows_dir));

    Ok(Arc::new(AppState {
        engine,
        registry,
        orchestrator,
        experiments,
        experiments_available,
        runner,
        catalog,
        webhook_secret: config.webhook_secret.clone(),
        webhook_permits: Arc::new(Semaphore::new(config.max_webhook_runs)),
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::to("/workflows") }))
        .route("/workflows", get(workflows::list_page))
        .route("/workflows/:run_id", get(workflows::detail_page))
        .route("/workflows/:run_id/json", get(workflows::detail_json))
        .route("/workflows/:run_id/restart", post(workflows::restart))
        .route("/workflows/:run_id/cancel", post(workflows::cancel))
        .route("/agents", get(orchestrator::agents_page))
        .route("/orchestrator/register", post(orchestrator::register))
        .route("/orchestrator/health-check", get(orchestrator::health_check))
        .route(
            "/orchestrator/:agent_id",
            delete(orchestrator::deregister),
        )
        .route(
            "/orchestrator/:agent_id/heartbeat",
            post(orchestrator::heartbeat),
        )
        .route("/orchestrator/:agent_id/schema", get(orchestrator::schema))
        .route("/orchestrator/:agent_id/execute", post(orchestrator::execute))
        .route("/optimization/experiments", get(optimization::experiments_page))
        .route("/optimization/compare", get(optimization::compare_page))
        .route("/optimization/apply", post(optimization::apply))
        .route("/webhooks/generic", post(webhooks::generic))
        .route("/health", get(chat::health))
        .with_state(state)
}
