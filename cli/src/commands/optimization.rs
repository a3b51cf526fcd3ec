//! `weft optimization …` — A/B runs, ranking, apply-best.

use std::path::Path;
use std::sync::Arc;

use weft::{ExperimentRunner, Plan, SqliteExperimentStore};

use super::{parse_inputs, run::local_engine, CliError};

fn local_runner() -> Result<ExperimentRunner, CliError> {
    let settings = config::Settings::from_env();
    let store = Arc::new(SqliteExperimentStore::new(&settings.experiment_db_path)?);
    Ok(ExperimentRunner::new(local_engine()?, store))
}

pub async fn ab_test(config_path: &Path, raw_inputs: &[String]) -> Result<(), CliError> {
    let plan = Plan::from_path(config_path)?;
    let inputs = parse_inputs(raw_inputs)?;
    let runner = local_runner()?;

    let report = runner.run_ab_test(&plan, inputs).await?;
    println!(
        "experiment `{}`: {} run(s) across {} variant(s), {} failed",
        report.experiment_name,
        report.total_runs,
        report.variants.len(),
        report.failed_runs,
    );
    for variant in &report.variants {
        println!("  variant {} × {}", variant, report.runs_per_variant);
    }

    // Gates on aggregates, with node-gate action semantics.
    let gates = plan.decl.gates();
    if !gates.is_empty() {
        let hits = runner.evaluate_gates(&report.experiment_name, gates).await?;
        for hit in &hits {
            println!(
                "  gate [{}] variant {}: {} = {:.6} (limit {:.6})",
                hit.hit.action, hit.variant_name, hit.hit.metric, hit.hit.value, hit.hit.limit,
            );
        }
        if hits
            .iter()
            .any(|h| h.hit.action == weft::GateAction::Fail)
        {
            return Err(CliError::RunFailed("a fail gate tripped on aggregates".into()));
        }
    }
    Ok(())
}

pub async fn evaluate(experiment: &str, metric: &str, minimize: bool) -> Result<(), CliError> {
    let runner = local_runner()?;
    let ranked = runner.evaluate(experiment, metric, minimize).await?;
    if ranked.is_empty() {
        println!("experiment `{}` has no runs with metric `{}`", experiment, metric);
        return Ok(());
    }
    println!(
        "experiment `{}` on `{}` ({}):",
        experiment,
        metric,
        if minimize { "lower is better" } else { "higher is better" },
    );
    for (i, stats) in ranked.iter().enumerate() {
        println!(
            "  {}. {} — n={} mean={:.6} p50={:.6} p90={:.6} p95={:.6} p99={:.6}",
            i + 1,
            stats.variant_name,
            stats.count,
            stats.mean,
            stats.p50,
            stats.p90,
            stats.p95,
            stats.p99,
        );
    }
    Ok(())
}

pub async fn apply_optimized(
    experiment: &str,
    workflow: &Path,
    metric: &str,
    minimize: bool,
) -> Result<(), CliError> {
    let runner = local_runner()?;
    let winner = runner.apply_best(experiment, workflow, metric, minimize).await?;
    println!(
        "applied variant `{}` (mean {} = {:.6}) to {}",
        winner.variant_name,
        metric,
        winner.mean,
        workflow.display(),
    );
    Ok(())
}
