//! Quality gates: predicates on metrics that emit an action.
//!
//! Gates are declared under `optimization.gates` and evaluated twice: per node
//! against the node's accumulated metrics, and per experiment variant against
//! aggregates. `warn` logs, `fail` aborts the run, `block_deploy` flags the
//! run without aborting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Action emitted when a gate trips. Closed set; anything else is a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Warn,
    Fail,
    BlockDeploy,
}

impl std::fmt::Display for GateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateAction::Warn => write!(f, "warn"),
            GateAction::Fail => write!(f, "fail"),
            GateAction::BlockDeploy => write!(f, "block_deploy"),
        }
    }
}

/// One gate: a metric name, an upper and/or lower bound, and the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateSpec {
    pub metric: String,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    pub action: GateAction,
}

/// A tripped gate: which metric, the observed value, and the violated bound.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateHit {
    pub metric: String,
    pub value: f64,
    pub limit: f64,
    pub action: GateAction,
}

/// Evaluates `gates` against a metric map. Gates whose metric is absent are
/// not applicable and never trip.
pub fn evaluate(gates: &[GateSpec], metrics: &BTreeMap<String, f64>) -> Vec<GateHit> {
    let mut hits = Vec::new();
    for gate in gates {
        let Some(&value) = metrics.get(&gate.metric) else {
            continue;
        };
        if let Some(max) = gate.max {
            if value > max {
                hits.push(GateHit {
                    metric: gate.metric.clone(),
                    value,
                    limit: max,
                    action: gate.action,
                });
                continue;
            }
        }
        if let Some(min) = gate.min {
            if value < min {
                hits.push(GateHit {
                    metric: gate.metric.clone(),
                    value,
                    limit: min,
                    action: gate.action,
                });
            }
        }
    }
    hits
}
