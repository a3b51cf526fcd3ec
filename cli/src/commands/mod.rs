//! CLI subcommand implementations.

pub mod optimization;
pub mod report;
pub mod run;
pub mod ui;
pub mod validate;

use std::collections::BTreeMap;

use serde_json::Value;
use weft::EngineError;

/// CLI-level error: what happened and which exit code it maps to.
#[derive(Debug)]
pub enum CliError {
    Engine(EngineError),
    /// The run itself failed (the record holds the detail).
    RunFailed(String),
    Runtime(String),
    Interrupted,
}

impl From<EngineError> for CliError {
    fn from(e: EngineError) -> Self {
        CliError::Engine(e)
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Engine(e) => write!(f, "{}", e),
            CliError::RunFailed(msg) => write!(f, "run failed: {}", msg),
            CliError::Runtime(msg) => write!(f, "{}", msg),
            CliError::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Engine(e) if e.is_user_error() => 1,
            CliError::Interrupted => 130,
            _ => 2,
        }
    }
}

/// Parses repeated `KEY=VALUE` arguments. Values that parse as JSON are kept
/// typed (`--input count=3` is an int); everything else is a string.
pub fn parse_inputs(pairs: &[String]) -> Result<BTreeMap<String, Value>, CliError> {
    let mut inputs = BTreeMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(CliError::Engine(EngineError::ConfigParse(format!(
                "--input `{}` is not KEY=VALUE",
                pair
            ))));
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

/// Supervised child entry: resolve the stable name, deserialize the
/// plain-data config record, and run until the process is terminated.
pub async fn child(name: &str, config_json: &str) -> Result<(), CliError> {
    let parse = |what: &str, e: serde_json::Error| {
        CliError::Runtime(format!("child `{}` config did not parse: {}", what, e))
    };
    match name {
        "dashboard" => {
            let config: serve::DashboardConfig =
                serde_json::from_str(config_json).map_err(|e| parse("dashboard", e))?;
            serve::run_dashboard(config)
                .await
                .map_err(|e| CliError::Runtime(e.to_string()))
        }
        "chat" => {
            let config: serve::ChatConfig =
                serde_json::from_str(config_json).map_err(|e| parse("chat", e))?;
            serve::run_chat(config)
                .await
                .map_err(|e| CliError::Runtime(e.to_string()))
        }
        other => Err(CliError::Runtime(format!("unknown child `{}`", other))),
    }
}
