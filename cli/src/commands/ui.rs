//! `weft ui` — start the supervised control-plane processes.

use tracing::info;

use crate::supervisor::{ChildCommand, ChildSpec, Supervisor};

use super::CliError;

#[derive(Debug)]
pub struct UiOptions {
    pub dashboard_port: Option<u16>,
    pub chat_port: Option<u16>,
    pub mlflow_port: Option<u16>,
    pub mlflow_uri: Option<String>,
    pub no_chat: bool,
}

fn render_config<T: serde::Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string(value).map_err(|e| CliError::Runtime(e.to_string()))
}

pub async fn execute(options: UiOptions) -> Result<(), CliError> {
    let settings = config::Settings::from_env();
    let dashboard_port = options.dashboard_port.unwrap_or(settings.dashboard_port);
    let chat_port = options.chat_port.unwrap_or(settings.chat_port);

    let dashboard_config = serve::DashboardConfig {
        port: dashboard_port,
        db_path: settings.db_path.clone(),
        experiment_db_path: settings.experiment_db_path.clone(),
        workflows_dir: settings.workflows_dir.clone(),
        webhook_secret: settings.webhook_secret.clone(),
        max_webhook_runs: settings.max_webhook_runs,
    };
    let mut children = vec![ChildSpec {
        name: "dashboard".to_string(),
        command: ChildCommand::Internal {
            subcommand: "dashboard".to_string(),
            config_json: render_config(&dashboard_config)?,
        },
        ready_port: Some(dashboard_port),
    }];

    if !options.no_chat {
        let chat_config = serve::ChatConfig {
            port: chat_port,
            db_path: settings.db_path.clone(),
            workflows_dir: settings.workflows_dir.clone(),
            workflow: settings.chat_workflow.clone(),
        };
        children.push(ChildSpec {
            name: "chat".to_string(),
            command: ChildCommand::Internal {
                subcommand: "chat".to_string(),
                config_json: render_config(&chat_config)?,
            },
            ready_port: Some(chat_port),
        });
    }

    match (options.mlflow_port, options.mlflow_uri.as_deref()) {
        (Some(port), _) => children.push(ChildSpec {
            name: "metrics-ui".to_string(),
            command: ChildCommand::External {
                program: "mlflow".to_string(),
                args: vec![
                    "ui".to_string(),
                    "--port".to_string(),
                    port.to_string(),
                    "--backend-store-uri".to_string(),
                    format!("sqlite:///{}", settings.experiment_db_path),
                ],
            },
            ready_port: Some(port),
        }),
        (None, Some(uri)) => info!(uri, "using already-running metrics UI"),
        (None, None) => {}
    }

    println!("dashboard  http://127.0.0.1:{}/workflows", dashboard_port);
    if !options.no_chat {
        println!("chat       http://127.0.0.1:{}/", chat_port);
    }
    if let Some(port) = options.mlflow_port {
        println!("metrics    http://127.0.0.1:{}/", port);
    }

    Supervisor::new(children).run().await
}
