//! Process supervisor for the control-plane UIs.
//!
//! Each child is an independent OS process addressed by a stable entry — an
//! internal subcommand of the current executable, or an external program —
//! plus a plain-data config record. No live handles, closures, or bound state
//! cross the spawn boundary; everything a child needs is in its record.
//!
//! Children start in dependency order, each waiting for its readiness port
//! to accept connections before the next starts. Child stdout/stderr is
//! pumped to the supervisor's streams line by line with a `[name]` prefix,
//! unbuffered. A child exit is reported and recorded, never auto-restarted.
//! On SIGINT/SIGTERM every child gets a terminate signal and a grace period,
//! then a kill.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{info, warn};

use crate::commands::CliError;

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL: Duration = Duration::from_millis(200);
const WATCH_POLL: Duration = Duration::from_millis(250);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How a child's entry point is addressed.
#[derive(Debug, Clone)]
pub enum ChildCommand {
    /// `current_exe() child <subcommand> --config <json>`.
    Internal {
        subcommand: String,
        config_json: String,
    },
    /// An external program (the optional metrics UI).
    External {
        program: String,
        args: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub name: String,
    pub command: ChildCommand,
    /// Readiness: the next child starts once this port accepts connections.
    pub ready_port: Option<u16>,
}

struct Running {
    name: String,
    child: Child,
    exit_code: Option<i32>,
}

pub struct Supervisor {
    children: Vec<ChildSpec>,
}

impl Supervisor {
    pub fn new(children: Vec<ChildSpec>) -> Self {
        Self { children }
    }

    /// Starts every child, then supervises until all exit (Ok) or a signal
    /// arrives (`Interrupted`, after graceful shutdown).
    pub async fn run(self) -> Result<(), CliError> {
        let mut running: Vec<Running> = Vec::new();
        for spec in &self.children {
            match spawn_child(spec) {
                Ok(child) => {
                    info!(child = %spec.name, pid = child.id(), "child started");
                    running.push(Running {
                        name: spec.name.clone(),
                        child,
                        exit_code: None,
                    });
                }
                Err(e) => {
                    // A child that cannot start takes the whole plane down.
                    shutdown(&mut running).await;
                    return Err(CliError::Runtime(format!(
                        "failed to start `{}`: {}",
                        spec.name, e
                    )));
                }
            }
            if let Some(port) = spec.ready_port {
                if !wait_for_port(port).await {
                    warn!(child = %spec.name, port, "child did not become ready in time");
                }
            }
        }

        let result = watch(&mut running).await;
        if matches!(result, Err(CliError::Interrupted)) {
            shutdown(&mut running).await;
        }
        result
    }
}

fn spawn_child(spec: &ChildSpec) -> std::io::Result<Child> {
    let mut command = match &spec.command {
        ChildCommand::Internal {
            subcommand,
            config_json,
        } => {
            let mut c = Command::new(std::env::current_exe()?);
            c.arg("child")
                .arg(subcommand)
                .arg("--config")
                .arg(config_json);
            c
        }
        ChildCommand::External { program, args } => {
            let mut c = Command::new(program);
            c.args(args);
            c
        }
    };
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        pump(spec.name.clone(), stdout, false);
    }
    if let Some(stderr) = child.stderr.take() {
        pump(spec.name.clone(), stderr, true);
    }
    Ok(child)
}

/// Copies child output to our streams, one `[name]`-prefixed line at a time,
/// flushing per line so interleaved logs stay readable.
fn pump(name: String, reader: impl Read + Send + 'static, to_stderr: bool) {
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if to_stderr {
                let stderr = std::io::stderr();
                let mut out = stderr.lock();
                let _ = writeln!(out, "[{}] {}", name, line);
                let _ = out.flush();
            } else {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                let _ = writeln!(out, "[{}] {}", name, line);
                let _ = out.flush();
            }
        }
    });
}

/// Polls until the port accepts a TCP connection or the timeout elapses.
async fn wait_for_port(port: u16) -> bool {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(READY_POLL).await;
    }
    false
}

/// Reports exits as they happen; returns Ok once every child is gone, or
/// `Interrupted` on SIGINT/SIGTERM.
async fn watch(running: &mut Vec<Running>) -> Result<(), CliError> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|e| CliError::Runtime(e.to_string()))?;

    loop {
        let interrupted = {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => true,
                    _ = sigterm.recv() => true,
                    _ = tokio::time::sleep(WATCH_POLL) => false,
                }
            }
            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => true,
                    _ = tokio::time::sleep(WATCH_POLL) => false,
                }
            }
        };
        if interrupted {
            return Err(CliError::Interrupted);
        }

        for r in running.iter_mut() {
            if r.exit_code.is_some() {
                continue;
            }
            match r.child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(-1);
                    println!("[{}] exited (code: {})", r.name, code);
                    r.exit_code = Some(code);
                }
                Ok(None) => {}
                Err(e) => warn!(child = %r.name, error = %e, "wait failed"),
            }
        }
        if running.iter().all(|r| r.exit_code.is_some()) {
            return Ok(());
        }
    }
}

fn terminate(child: &Child) {
    #[cfg(unix)]
    {
        // SIGTERM first so children can close listeners and flush.
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child;
    }
}

/// Terminate with grace, then kill whatever is left.
async fn shutdown(running: &mut [Running]) {
    for r in running.iter() {
        if r.exit_code.is_none() {
            terminate(&r.child);
        }
    }
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while tokio::time::Instant::now() < deadline {
        let mut all_done = true;
        for r in running.iter_mut() {
            if r.exit_code.is_none() {
                match r.child.try_wait() {
                    Ok(Some(status)) => {
                        r.exit_code = Some(status.code().unwrap_or(-1));
                        println!("[{}] exited (code: {})", r.name, r.exit_code.unwrap_or(-1));
                    }
                    _ => all_done = false,
                }
            }
        }
        if all_done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    for r in running.iter_mut() {
        if r.exit_code.is_none() {
            warn!(child = %r.name, "grace period over, killing");
            let _ = r.child.kill();
            let _ = r.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn sh(name: &str, script: &str) -> ChildSpec {
        ChildSpec {
            name: name.to_string(),
            command: ChildCommand::External {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
            ready_port: None,
        }
    }

    /// All children exiting on their own completes supervision with their
    /// exit codes reported.
    #[cfg(unix)]
    #[tokio::test]
    async fn supervision_ends_when_children_exit() {
        let supervisor = Supervisor::new(vec![
            sh("one", "echo hello-from-one"),
            sh("two", "exit 3"),
        ]);
        supervisor.run().await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_port_sees_a_bound_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Keep accepting so connect() succeeds.
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        assert!(wait_for_port(port).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_terminates_stubborn_children() {
        let spec = sh("sleeper", "sleep 300");
        let child = spawn_child(&spec).unwrap();
        let mut running = vec![Running {
            name: spec.name.clone(),
            child,
            exit_code: None,
        }];
        shutdown(&mut running).await;
        assert!(running[0].exit_code.is_some());
    }
}
