//! `ProcessRunner`: executes each script in its own child process.
//!
//! The payload is handed to the script as JSON on stdin and in the
//! `CADENCE_PAYLOAD` environment variable. Termination is always forceful:
//! the deadline and [`RunHandle::terminate`] both end in SIGKILL.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::RunnerConfig;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RunnerError},
    runner::ExecutionRunner,
    types::{RunCompletion, RunHandle},
};

/// Environment variable carrying the JSON payload.
pub const PAYLOAD_ENV: &str = "CADENCE_PAYLOAD";

/// Runs scripts as child processes, optionally through an interpreter.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    interpreter: Option<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
        }
    }

    /// Launch scripts as `<interpreter> <script>` instead of executing them directly.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    fn command(&self, script: &Path) -> Command {
        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(script);
                command
            }
            None => Command::new(script),
        };
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl ExecutionRunner for ProcessRunner {
    async fn run(
        &self,
        script: &Path,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<RunHandle> {
        let payload_json = serde_json::to_string(payload)?;

        let mut child = self
            .command(script)
            .env(PAYLOAD_ENV, &payload_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {e}", script.display())))?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Spawn("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Spawn("stderr was not captured".to_string()))?;

        // Feed the payload on a separate task so a script that never reads
        // stdin cannot stall the launch.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload_json.as_bytes()).await {
                    debug!(error = %e, "script closed stdin before reading payload");
                }
            });
        }

        let terminator = CancellationToken::new();
        let (completion_tx, completion_rx) = oneshot::channel();
        let cancel = terminator.clone();

        info!(script = %script.display(), ?pid, timeout_ms = timeout.as_millis() as u64, "script launched");

        tokio::spawn(async move {
            let completion = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => match status.code() {
                        Some(code) => RunCompletion::exited(code),
                        None => RunCompletion::killed().with_error("terminated by signal"),
                    },
                    Err(e) => RunCompletion::killed().with_error(format!("wait failed: {e}")),
                },
                _ = cancel.cancelled() => {
                    kill(&mut child, pid).await;
                    RunCompletion::killed()
                }
                _ = tokio::time::sleep(timeout) => {
                    kill(&mut child, pid).await;
                    RunCompletion::timed_out()
                }
            };
            debug!(?pid, status = %completion.status, exit_code = ?completion.exit_code, "script ended");
            // Receiver may already be gone if the caller stopped waiting.
            let _ = completion_tx.send(completion);
        });

        Ok(RunHandle {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            completion: completion_rx,
            terminator,
        })
    }
}

async fn kill(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.kill().await {
        warn!(?pid, error = %e, "failed to kill script process");
    } else {
        info!(?pid, "script process killed");
    }
}
