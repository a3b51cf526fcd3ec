//! Environment loading and typed settings for Weft.
//!
//! `load_and_apply` reads `.env` from the working directory once at process
//! start and sets only the keys that are **not** already in the process
//! environment — runtime-provided variables always win. There are no
//! singletons: callers read a [`Settings`] snapshot at the point of need.

mod dotenv;

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Applies `.env` (from `override_dir` or the current directory) to the
/// process environment; existing variables are never overwritten.
pub fn load_and_apply(override_dir: Option<&Path>) -> Result<(), LoadError> {
    let map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;
    for (key, value) in map {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

/// Control-plane settings, read from `WEFT_*` environment variables with
/// local-install defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Shared relational database for runs and agents.
    pub db_path: String,
    /// Experiment store database (a separate collaborator; may be absent).
    pub experiment_db_path: String,
    /// Directory of workflow declarations served by the control plane.
    pub workflows_dir: String,
    pub dashboard_port: u16,
    pub chat_port: u16,
    /// Workflow the chat UI drives; defaults to the first in the catalog.
    pub chat_workflow: Option<String>,
    /// Shared secret for webhook HMAC verification; unset disables it.
    pub webhook_secret: Option<String>,
    /// Bound on concurrently webhook-triggered runs.
    pub max_webhook_runs: usize,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: "weft.db".to_string(),
            experiment_db_path: "weft_experiments.db".to_string(),
            workflows_dir: "workflows".to_string(),
            dashboard_port: 8050,
            chat_port: 8051,
            chat_workflow: None,
            webhook_secret: None,
            max_webhook_runs: 4,
        }
    }
}

impl Settings {
    /// Snapshot of the environment right now.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: var("WEFT_DB").unwrap_or(defaults.db_path),
            experiment_db_path: var("WEFT_EXPERIMENT_DB").unwrap_or(defaults.experiment_db_path),
            workflows_dir: var("WEFT_WORKFLOWS_DIR").unwrap_or(defaults.workflows_dir),
            dashboard_port: parsed("WEFT_DASHBOARD_PORT", defaults.dashboard_port),
            chat_port: parsed("WEFT_CHAT_PORT", defaults.chat_port),
            chat_workflow: var("WEFT_CHAT_WORKFLOW"),
            webhook_secret: var("WEFT_WEBHOOK_SECRET"),
            max_webhook_runs: parsed("WEFT_MAX_WEBHOOK_RUNS", defaults.max_webhook_runs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_env_wins_over_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "CONFIG_TEST_WINS=from_dotenv\nCONFIG_TEST_NEW=fresh\n",
        )
        .unwrap();
        std::env::set_var("CONFIG_TEST_WINS", "from_env");

        load_and_apply(Some(dir.path())).unwrap();
        assert_eq!(
            std::env::var("CONFIG_TEST_WINS").as_deref(),
            Ok("from_env")
        );
        assert_eq!(std::env::var("CONFIG_TEST_NEW").as_deref(), Ok("fresh"));

        std::env::remove_var("CONFIG_TEST_WINS");
        std::env::remove_var("CONFIG_TEST_NEW");
    }

    #[test]
    fn load_and_apply_without_dotenv_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        load_and_apply(Some(dir.path())).unwrap();
    }

    #[test]
    fn settings_defaults() {
        let s = Settings::default();
        assert_eq!(s.db_path, "weft.db");
        assert_eq!(s.dashboard_port, 8050);
        assert_eq!(s.max_webhook_runs, 4);
        assert!(s.webhook_secret.is_none());
    }

    #[test]
    fn settings_read_overrides_from_env() {
        std::env::set_var("WEFT_DASHBOARD_PORT", "9100");
        std::env::set_var("WEFT_WEBHOOK_SECRET", "s3cret");
        let s = Settings::from_env();
        assert_eq!(s.dashboard_port, 9100);
        assert_eq!(s.webhook_secret.as_deref(), Some("s3cret"));
        std::env::remove_var("WEFT_DASHBOARD_PORT");
        std::env::remove_var("WEFT_WEBHOOK_SECRET");
    }

    #[test]
    fn unparsable_port_falls_back_to_default() {
        std::env::set_var("WEFT_CHAT_PORT", "not-a-port");
        assert_eq!(Settings::from_env().chat_port, 8051);
        std::env::remove_var("WEFT_CHAT_PORT");
    }
}
