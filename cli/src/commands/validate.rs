//! `weft validate <config>` — parse + semantic validation only.

use std::path::Path;

use weft::{EngineError, Plan};

use super::CliError;

pub fn execute(config_path: &Path) -> Result<(), CliError> {
    match Plan::from_path(config_path) {
        Ok(plan) => {
            println!(
                "{}: ok — workflow `{}`, {} node(s): {}",
                config_path.display(),
                plan.name(),
                plan.order.len(),
                plan.order.join(" → "),
            );
            Ok(())
        }
        Err(EngineError::ConfigValidation(report)) => {
            eprintln!("{}: invalid", config_path.display());
            for issue in &report.issues {
                eprintln!("  {}", issue);
            }
            Err(CliError::Engine(EngineError::ConfigValidation(report)))
        }
        Err(e) => Err(CliError::Engine(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(
            &path,
            r#"
schema_version: "1.0"
flow: { name: ok }
state:
  fields:
    message: { type: str, required: true }
    result: { type: str }
nodes:
  - id: only
    prompt: "Do {message}"
    llm: { provider: echo, model: echo-1 }
    outputs: [result]
edges:
  - { from: START, to: only }
  - { from: only, to: END }
"#,
        )
        .unwrap();
        execute(&path).unwrap();
    }

    #[test]
    fn invalid_file_is_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(
            &path,
            r#"
schema_version: "1.0"
flow: { name: broken }
state:
  fields:
    result: { type: str }
nodes:
  - id: only
    prompt: "Do {missing}"
    outputs: [result]
edges:
  - { from: START, to: only }
  - { from: only, to: END }
"#,
        )
        .unwrap();
        let err = execute(&path).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
