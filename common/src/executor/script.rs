// Built-in handler that runs the job payload as a shell script

use super::{JobContext, JobHandler};
use crate::errors::ExecutionError;
use crate::models::Job;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Runs the payload with `sh -c` inside the working directory
///
/// Stdout becomes the job output with trailing newlines trimmed. A non-zero
/// exit fails the job with stderr (or the exit code) as detail. A script that
/// has already started is left to finish when cancellation is requested.
#[derive(Debug, Clone)]
pub struct ScriptHandler {
    shell: String,
}

impl ScriptHandler {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl Default for ScriptHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for ScriptHandler {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn run(&self, job: &Job, ctx: JobContext) -> Result<String, ExecutionError> {
        if ctx.is_canceled() {
            return Err(ExecutionError::Canceled);
        }

        let script = job.payload.content_lossy();
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&script)
            .env("FOREMAN_JOB_ID", &job.id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if ctx.workdir().is_dir() {
            command.current_dir(ctx.workdir());
        }

        debug!(shell = %self.shell, "Spawning script");
        let output = command
            .output()
            .await
            .map_err(|e| ExecutionError::Failed(format!("Failed to spawn script: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim_end_matches(['\n', '\r']).to_string();

        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(ExecutionError::Failed(if stderr.is_empty() {
                format!("Exit code: {:?}", output.status.code())
            } else {
                stderr
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JobExecutor;
    use crate::models::{JobPayload, JobState, HANDLER_NAME};
    use crate::registry::JobRegistry;
    use std::sync::Arc;

    async fn run_script(script: &str) -> Job {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let executor = JobExecutor::new(
            HANDLER_NAME,
            Arc::clone(&registry),
            Arc::new(ScriptHandler::new()),
            dir.path(),
        );
        let job = registry
            .create("s1", HANDLER_NAME, JobPayload::new(script), false)
            .unwrap();
        executor.submit(&job).unwrap();
        registry.wait_terminal("s1").await.unwrap()
    }

    #[tokio::test]
    async fn test_echo_output_is_trimmed() {
        let job = run_script("echo hi").await;
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.output, "hi");
    }

    #[tokio::test]
    async fn test_multiline_output_preserved() {
        let job = run_script("printf 'a\\nb\\n'").await;
        assert_eq!(job.output, "a\nb");
    }

    #[tokio::test]
    async fn test_failing_script_reports_stderr() {
        let job = run_script("echo oops >&2; exit 3").await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.output, "oops");
    }

    #[tokio::test]
    async fn test_silent_failure_reports_exit_code() {
        let job = run_script("exit 4").await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.output, "Exit code: Some(4)");
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let job = run_script("touch artifact && ls").await;
        assert_eq!(job.output, "artifact");
    }

    #[tokio::test]
    async fn test_job_id_exported() {
        let job = run_script("echo $FOREMAN_JOB_ID").await;
        assert_eq!(job.output, "s1");
    }
}
