//! A/B experimentation: variant expansion, aggregation, gates, apply-best.
//!
//! A variant overrides one node's prompt. The runner executes each variant
//! `run_count` times through the engine, logging every run into the
//! experiment store tagged `{experiment_name, variant_name}`. Evaluation
//! ranks variants by mean with nearest-rank percentiles; ties break ascending
//! by variant name. `apply_best` rewrites the declaration file with the
//! winning prompt after backing the original up.

pub mod store;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::EngineError;
use crate::gates::{GateHit, GateSpec};
use crate::graph::{build_plan, Engine, Plan, RunOptions};
use crate::schema::Declaration;

pub use store::{ExperimentRun, ExperimentStore, MemoryExperimentStore, SqliteExperimentStore};

/// Nearest-rank percentile over an ascending-sorted slice:
/// `index = ceil(p/100 * n) - 1`, clamped to `[0, n-1]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(n - 1)]
}

/// Per-variant aggregate of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantStats {
    pub variant_name: String,
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Aggregates runs per variant for `metric`. Runs without the metric are
/// skipped; variants are returned in name order (unranked).
pub fn aggregate(runs: &[ExperimentRun], metric: &str) -> Vec<VariantStats> {
    let mut by_variant: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for run in runs {
        if let Some(&value) = run.metrics.get(metric) {
            by_variant.entry(&run.variant_name).or_default().push(value);
        }
    }
    by_variant
        .into_iter()
        .map(|(variant, mut values)| {
            values.sort_by(|a, b| a.total_cmp(b));
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            VariantStats {
                variant_name: variant.to_string(),
                count: values.len(),
                mean,
                p50: percentile(&values, 50.0),
                p90: percentile(&values, 90.0),
                p95: percentile(&values, 95.0),
                p99: percentile(&values, 99.0),
            }
        })
        .collect()
}

/// Outcome summary of one A/B execution.
#[derive(Debug, Clone, Serialize)]
pub struct AbTestReport {
    pub experiment_name: String,
    pub variants: Vec<String>,
    pub runs_per_variant: u32,
    pub total_runs: usize,
    pub failed_runs: usize,
}

/// A gate evaluated against one variant's aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateGateHit {
    pub variant_name: String,
    #[serde(flatten)]
    pub hit: GateHit,
}

pub struct ExperimentRunner {
    engine: Arc<Engine>,
    store: Arc<dyn ExperimentStore>,
}

impl ExperimentRunner {
    pub fn new(engine: Arc<Engine>, store: Arc<dyn ExperimentStore>) -> Self {
        Self {
            engine,
            store,
        }
    }

    /// Runs the plan's `optimization.ab_test`: each variant's prompt is
    /// substituted into its node, the workflow executes `run_count` times,
    /// and every run lands in the experiment store.
    pub async fn run_ab_test(
        &self,
        plan: &Plan,
        inputs: BTreeMap<String, serde_json::Value>,
    ) -> Result<AbTestReport, EngineError> {
        let ab = plan
            .decl
            .optimization
            .as_ref()
            .and_then(|o| o.ab_test.as_ref())
            .ok_or_else(|| {
                EngineError::validation("optimization.ab_test", "no A/B test configured")
            })?
            .clone();

        let mut total = 0usize;
        let mut failed = 0usize;
        for variant in &ab.variants {
            let variant_plan = variant_plan(&plan.decl, &variant.node_id, &variant.prompt)?;
            info!(
                experiment = %ab.experiment_name,
                variant = %variant.name,
                node = %variant.node_id,
                runs = ab.run_count,
                "running variant"
            );
            for _ in 0..ab.run_count {
                let record = self
                    .engine
                    .execute(&variant_plan, inputs.clone(), RunOptions::default())
                    .await?;
                total += 1;
                if record.status != crate::runs::RunStatus::Completed {
                    failed += 1;
                }
                self.store
                    .log_run(&ExperimentRun {
                        experiment_name: ab.experiment_name.clone(),
                        variant_name: variant.name.clone(),
                        run_id: record.run_id,
                        metrics: record.metrics.clone(),
                        started_at: record.started_at,
                        status: record.status,
                    })
                    .await?;
            }
        }
        Ok(AbTestReport {
            experiment_name: ab.experiment_name.clone(),
            variants: ab.variants.iter().map(|v| v.name.clone()).collect(),
            runs_per_variant: ab.run_count,
            total_runs: total,
            failed_runs: failed,
        })
    }

    /// Ranked variant aggregates for `metric`: best first (smallest mean when
    /// `minimize`, largest otherwise), ties ascending by variant name.
    pub async fn evaluate(
        &self,
        experiment_name: &str,
        metric: &str,
        minimize: bool,
    ) -> Result<Vec<VariantStats>, EngineError> {
        let mut stats = self.store.get_aggregate(experiment_name, metric).await?;
        stats.sort_by(|a, b| {
            let ord = a.mean.total_cmp(&b.mean);
            let ord = if minimize { ord } else { ord.reverse() };
            ord.then_with(|| a.variant_name.cmp(&b.variant_name))
        });
        Ok(stats)
    }

    /// Evaluates experiment-level gates against each variant's mean of the
    /// gate's metric, with node-gate action semantics.
    pub async fn evaluate_gates(
        &self,
        experiment_name: &str,
        gates: &[GateSpec],
    ) -> Result<Vec<AggregateGateHit>, EngineError> {
        let mut hits = Vec::new();
        for gate in gates {
            let stats = self.store.get_aggregate(experiment_name, &gate.metric).await?;
            for stat in stats {
                let metrics: BTreeMap<String, f64> =
                    [(gate.metric.clone(), stat.mean)].into_iter().collect();
                for hit in crate::gates::evaluate(std::slice::from_ref(gate), &metrics) {
                    hits.push(AggregateGateHit {
                        variant_name: stat.variant_name.clone(),
                        hit,
                    });
                }
            }
        }
        Ok(hits)
    }

    /// Rewrites `workflow_path` with the winning variant's prompt after
    /// writing a timestamped backup next to the original. Returns the winner.
    pub async fn apply_best(
        &self,
        experiment_name: &str,
        workflow_path: &Path,
        metric: &str,
        minimize: bool,
    ) -> Result<VariantStats, EngineError> {
        let ranked = self.evaluate(experiment_name, metric, minimize).await?;
        let winner = ranked.into_iter().next().ok_or_else(|| {
            EngineError::StoreUnavailable(format!(
                "experiment `{}` has no runs with metric `{}`",
                experiment_name, metric
            ))
        })?;

        let (decl, source) = Declaration::load(workflow_path)?;
        let variant = decl
            .optimization
            .as_ref()
            .and_then(|o| o.ab_test.as_ref())
            .and_then(|ab| ab.variants.iter().find(|v| v.name == winner.variant_name))
            .ok_or_else(|| {
                EngineError::validation(
                    "optimization.ab_test.variants",
                    format!("winning variant `{}` is not declared", winner.variant_name),
                )
            })?
            .clone();

        let backup = workflow_path.with_extension(format!(
            "{}.{}.bak",
            workflow_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("yaml"),
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
        ));
        std::fs::write(&backup, &source)
            .map_err(|e| EngineError::Storage(format!("backup {}: {}", backup.display(), e)))?;

        let mut updated = decl;
        let node = updated
            .nodes
            .iter_mut()
            .find(|n| n.id == variant.node_id)
            .ok_or_else(|| {
                EngineError::validation(
                    "optimization.ab_test.variants",
                    format!("variant node `{}` is not declared", variant.node_id),
                )
            })?;
        node.prompt = variant.prompt.clone();

        let rendered = match workflow_path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::to_string_pretty(&updated)
                .map_err(|e| EngineError::Storage(e.to_string()))?,
            _ => serde_yaml::to_string(&updated)
                .map_err(|e| EngineError::Storage(e.to_string()))?,
        };
        std::fs::write(workflow_path, rendered).map_err(|e| {
            EngineError::Storage(format!("write {}: {}", workflow_path.display(), e))
        })?;
        info!(
            experiment = experiment_name,
            variant = %winner.variant_name,
            path = %workflow_path.display(),
            "applied winning variant"
        );
        Ok(winner)
    }
}

/// Builds the plan for one variant: the named node's prompt replaced. The
/// node must exist; variants are checked here because schema validation does
/// not cover the optimization block's cross-references.
fn variant_plan(decl: &Declaration, node_id: &str, prompt: &str) -> Result<Plan, EngineError> {
    let mut overridden = decl.clone();
    let node = overridden
        .nodes
        .iter_mut()
        .find(|n| n.id == node_id)
        .ok_or_else(|| {
            EngineError::validation(
                "optimization.ab_test.variants",
                format!("variant node `{}` is not declared", node_id),
            )
        })?;
    node.prompt = prompt.to_string();
    build_plan(overridden)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{EchoLlm, SingleClientFactory};
    use crate::runs::memory::MemoryRunRepository;
    use crate::tools::ToolRegistry;
    use serde_json::json;

    const AB: &str = r#"
schema_version: "1.0"
flow: { name: echo-ab }
state:
  fields:
    message: { type: str, required: true }
    result: { type: str }
nodes:
  - id: echo
    prompt: "Echo: {message}"
    llm: { provider: echo, model: echo-1 }
    outputs: [result]
edges:
  - { from: START, to: echo }
  - { from: echo, to: END }
optimization:
  ab_test:
    experiment_name: prompt-test
    run_count: 3
    variants:
      - { name: a, prompt: "A says {message}", node_id: echo }
      - { name: b, prompt: "B hears {message}", node_id: echo }
"#;

    fn runner() -> (ExperimentRunner, Arc<MemoryExperimentStore>) {
        let engine = Arc::new(Engine::new(
            Arc::new(MemoryRunRepository::new()),
            Arc::new(SingleClientFactory(Arc::new(EchoLlm))),
            Arc::new(ToolRegistry::new()),
        ));
        let store = Arc::new(MemoryExperimentStore::new());
        (ExperimentRunner::new(engine, store.clone()), store)
    }

    #[test]
    fn percentile_nearest_rank() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&values, 50.0), 5.0);
        assert_eq!(percentile(&values, 90.0), 9.0);
        assert_eq!(percentile(&values, 95.0), 10.0);
        assert_eq!(percentile(&values, 99.0), 10.0);
        // Clamps at both ends.
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&[42.0], 50.0), 42.0);
    }

    #[tokio::test]
    async fn ab_test_logs_run_count_times_variant_count() {
        let (runner, store) = runner();
        let plan = Plan::from_yaml_str(AB).unwrap();
        let inputs = [("message".to_string(), json!("hi"))].into_iter().collect();
        let report = runner.run_ab_test(&plan, inputs).await.unwrap();
        assert_eq!(report.total_runs, 6);
        assert_eq!(report.failed_runs, 0);

        let runs = store.list_runs("prompt-test", None).await.unwrap();
        assert_eq!(runs.len(), 6);
        assert_eq!(
            runs.iter().filter(|r| r.variant_name == "a").count(),
            3
        );
    }

    #[tokio::test]
    async fn evaluate_ranks_by_mean_with_name_tiebreak() {
        let (runner, store) = runner();
        let mk = |variant: &str, cost: f64| ExperimentRun {
            experiment_name: "exp".into(),
            variant_name: variant.into(),
            run_id: uuid::Uuid::new_v4(),
            metrics: [("cost_usd".to_string(), cost)].into_iter().collect(),
            started_at: chrono::Utc::now(),
            status: crate::runs::RunStatus::Completed,
        };
        for run in [mk("b", 0.1), mk("b", 0.3), mk("a", 0.2), mk("a", 0.2), mk("c", 0.5)] {
            store.log_run(&run).await.unwrap();
        }

        let ranked = runner.evaluate("exp", "cost_usd", true).await.unwrap();
        // a and b both have mean 0.2; tie breaks ascending by name.
        assert_eq!(
            ranked.iter().map(|s| s.variant_name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(ranked[0].count, 2);

        let maximized = runner.evaluate("exp", "cost_usd", false).await.unwrap();
        assert_eq!(maximized[0].variant_name, "c");
    }

    #[tokio::test]
    async fn aggregate_gates_flag_expensive_variants() {
        let (runner, store) = runner();
        let mk = |variant: &str, cost: f64| ExperimentRun {
            experiment_name: "exp".into(),
            variant_name: variant.into(),
            run_id: uuid::Uuid::new_v4(),
            metrics: [("cost_usd".to_string(), cost)].into_iter().collect(),
            started_at: chrono::Utc::now(),
            status: crate::runs::RunStatus::Completed,
        };
        store.log_run(&mk("cheap", 0.01)).await.unwrap();
        store.log_run(&mk("pricey", 0.90)).await.unwrap();

        let gates = vec![GateSpec {
            metric: "cost_usd".into(),
            max: Some(0.50),
            min: None,
            action: crate::gates::GateAction::BlockDeploy,
        }];
        let hits = runner.evaluate_gates("exp", &gates).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].variant_name, "pricey");
    }

    #[tokio::test]
    async fn apply_best_rewrites_file_with_backup() {
        let (runner, _store) = runner();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(&path, AB).unwrap();

        // Seed the store: variant b wins on cost.
        let mk = |variant: &str, cost: f64| ExperimentRun {
            experiment_name: "prompt-test".into(),
            variant_name: variant.into(),
            run_id: uuid::Uuid::new_v4(),
            metrics: [("cost_usd".to_string(), cost)].into_iter().collect(),
            started_at: chrono::Utc::now(),
            status: crate::runs::RunStatus::Completed,
        };
        runner.store.log_run(&mk("a", 0.4)).await.unwrap();
        runner.store.log_run(&mk("b", 0.1)).await.unwrap();

        let winner = runner
            .apply_best("prompt-test", &path, "cost_usd", true)
            .await
            .unwrap();
        assert_eq!(winner.variant_name, "b");

        let (rewritten, _) = Declaration::load(&path).unwrap();
        assert_eq!(rewritten.nodes[0].prompt, "B hears {message}");

        // Exactly one backup holding the original text.
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |x| x == "bak"))
            .collect();
        assert_eq!(backups.len(), 1);
        let original = std::fs::read_to_string(backups[0].path()).unwrap();
        assert!(original.contains("Echo: {message}"), "backup keeps original");
    }

    #[tokio::test]
    async fn unknown_variant_node_is_rejected() {
        let decl = Declaration::from_yaml_str(AB).unwrap();
        let err = variant_plan(&decl, "ghost", "p").unwrap_err();
        assert!(err.to_string().contains("`ghost` is not declared"), "{}", err);
    }

}
