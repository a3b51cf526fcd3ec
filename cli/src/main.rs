//! Weft CLI: run and validate workflows, start the supervised UIs, drive A/B
//! experiments, and report costs.
//!
//! Exit codes: 0 success, 1 user error (bad config or arguments), 2 runtime
//! error, 130 interrupted.

mod commands;
mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use commands::CliError;

#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(about = "Weft — configuration-driven LLM workflow engine")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a workflow and print its outputs
    Run {
        /// Workflow declaration (.yaml/.yml/.json)
        config: PathBuf,
        /// Workflow input as KEY=VALUE (repeatable); values parse as JSON
        /// when they can, else as strings
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
    /// Parse and semantically validate a declaration
    Validate {
        config: PathBuf,
    },
    /// Start the supervised control-plane UIs (dashboard, chat, metrics)
    Ui(UiArgs),
    /// A/B experiments: run variants, rank them, apply the winner
    Optimization {
        #[command(subcommand)]
        cmd: OptimizationCmd,
    },
    /// Reports over persisted run history
    Report {
        #[command(subcommand)]
        cmd: ReportCmd,
    },
    /// Supervised child entry: a stable subcommand name plus a plain-data
    /// JSON config record. Never invoked by hand.
    #[command(hide = true)]
    Child {
        name: String,
        #[arg(long)]
        config: String,
    },
}

#[derive(clap::Args, Debug)]
struct UiArgs {
    #[arg(long, value_name = "PORT")]
    dashboard_port: Option<u16>,
    #[arg(long, value_name = "PORT")]
    chat_port: Option<u16>,
    /// Spawn the external metrics UI on this port
    #[arg(long, value_name = "PORT", conflicts_with = "mlflow_uri")]
    mlflow_port: Option<u16>,
    /// Use an already-running metrics UI instead of spawning one
    #[arg(long, value_name = "URL")]
    mlflow_uri: Option<String>,
    /// Do not start the chat UI
    #[arg(long)]
    no_chat: bool,
}

#[derive(Subcommand, Debug)]
enum OptimizationCmd {
    /// Run every variant of the declaration's A/B test
    AbTest {
        config: PathBuf,
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
    /// Print the ranked variants of an experiment
    Evaluate {
        #[arg(long)]
        experiment: String,
        #[arg(long, default_value = "cost_usd")]
        metric: String,
        /// Rank descending (higher is better)
        #[arg(long)]
        maximize: bool,
    },
    /// Rewrite a workflow with the winning variant's prompt
    ApplyOptimized {
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        workflow: PathBuf,
        #[arg(long, default_value = "cost_usd")]
        metric: String,
        #[arg(long)]
        maximize: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ReportCmd {
    /// Aggregate run cost and duration per workflow
    Costs {
        /// Relative window like 7d, 24h, 4w
        #[arg(long, conflicts_with_all = ["start", "end"])]
        period: Option<String>,
        /// Inclusive start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,
        /// Inclusive end date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        workflow: Option<String>,
        /// Write to a file instead of stdout
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
        format: ReportFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Json,
    Csv,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help/--version print and exit 0; real usage errors are the
            // caller's fault.
            let is_usage_error = e.use_stderr();
            let _ = e.print();
            return if is_usage_error {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // `.env` from the CWD, once, before anything reads settings. Runtime
    // environment always wins.
    let _ = config::load_and_apply(None);
    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("weft: failed to start runtime: {}", e);
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(dispatch(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !matches!(e, CliError::Interrupted) {
                eprintln!("weft: {}", e);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn dispatch(args: Args) -> Result<(), CliError> {
    match args.cmd {
        Command::Run { config, inputs } => {
            commands::run::interruptible(commands::run::execute(&config, &inputs)).await
        }
        Command::Validate { config } => commands::validate::execute(&config),
        Command::Ui(ui) => {
            commands::ui::execute(commands::ui::UiOptions {
                dashboard_port: ui.dashboard_port,
                chat_port: ui.chat_port,
                mlflow_port: ui.mlflow_port,
                mlflow_uri: ui.mlflow_uri,
                no_chat: ui.no_chat,
            })
            .await
        }
        Command::Optimization { cmd } => match cmd {
            OptimizationCmd::AbTest { config, inputs } => {
                commands::run::interruptible(commands::optimization::ab_test(&config, &inputs))
                    .await
            }
            OptimizationCmd::Evaluate {
                experiment,
                metric,
                maximize,
            } => commands::optimization::evaluate(&experiment, &metric, !maximize).await,
            OptimizationCmd::ApplyOptimized {
                experiment,
                workflow,
                metric,
                maximize,
            } => {
                commands::optimization::apply_optimized(&experiment, &workflow, &metric, !maximize)
                    .await
            }
        },
        Command::Report { cmd } => match cmd {
            ReportCmd::Costs {
                period,
                start,
                end,
                workflow,
                output,
                format,
            } => {
                commands::report::costs(commands::report::CostsOptions {
                    period,
                    start,
                    end,
                    workflow,
                    output,
                    csv: format == ReportFormat::Csv,
                })
                .await
            }
        },
        Command::Child { name, config } => commands::child(&name, &config).await,
    }
}
