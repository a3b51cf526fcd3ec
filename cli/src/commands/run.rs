//! `weft run <config> [--input k=v]…`

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use weft::{DefaultLlmFactory, Engine, Plan, RunOptions, RunStatus, SqliteRunRepository, ToolRegistry};

use super::{parse_inputs, CliError};

/// Builds the standard local engine over the shared SQLite store.
pub fn local_engine() -> Result<Arc<Engine>, CliError> {
    let settings = config::Settings::from_env();
    let repo = Arc::new(SqliteRunRepository::new(&settings.db_path)?);
    Ok(Arc::new(Engine::new(
        repo,
        Arc::new(DefaultLlmFactory),
        Arc::new(ToolRegistry::new()),
    )))
}

/// Runs a future until done or Ctrl-C (exit code 130).
pub async fn interruptible<F>(work: F) -> Result<(), CliError>
where
    F: Future<Output = Result<(), CliError>>,
{
    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => Err(CliError::Interrupted),
    }
}

pub async fn execute(config_path: &Path, raw_inputs: &[String]) -> Result<(), CliError> {
    let plan = Plan::from_path(config_path)?;
    let inputs = parse_inputs(raw_inputs)?;
    let engine = local_engine()?;

    let record = engine.execute(&plan, inputs, RunOptions::default()).await?;
    match record.status {
        RunStatus::Completed => {
            println!(
                "{}",
                serde_json::to_string_pretty(&record.outputs)
                    .map_err(|e| CliError::Runtime(e.to_string()))?
            );
            eprintln!(
                "run {} completed in {:.2}s (${:.4})",
                record.run_id,
                record.duration_seconds.unwrap_or(0.0),
                record.cost_usd.unwrap_or(0.0),
            );
            Ok(())
        }
        status => Err(CliError::RunFailed(format!(
            "run {} is {}: {}",
            record.run_id,
            status,
            record.error.as_deref().unwrap_or("no detail recorded"),
        ))),
    }
}
