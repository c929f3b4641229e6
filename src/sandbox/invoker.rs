use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CompilerConfig;

use super::Workspace;

const CAPTURE_CHUNK: usize = 8192;

/// How a compiler invocation came to an end
#[derive(Debug)]
pub enum RunOutcome {
    /// The process terminated by itself
    Exited(ExitStatus),
    /// The process group was killed after the timeout elapsed
    TimedOut,
    /// The process group was killed because the service is shutting down
    Aborted,
}

/// Everything observed while running the compiler once
#[derive(Debug)]
pub struct Invocation {
    pub outcome: RunOutcome,
    pub raw_log: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl Invocation {
    pub fn exit_ok(&self) -> bool {
        matches!(self.outcome, RunOutcome::Exited(status) if status.success())
    }
}

/// The compiler never ran, which points at the environment rather than the document
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("compiler command is empty")]
    EmptyCommand,

    #[error("compiler executable `{program}` was not found")]
    NotFound { program: String },

    #[error("permission denied while launching compiler `{program}`")]
    PermissionDenied { program: String },

    #[error("failed to launch compiler `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for compiler `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    fn from_launch(program: &str, source: io::Error) -> Self {
        let program = program.to_string();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { program },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { program },
            _ => Self::Launch { program, source },
        }
    }
}

/// Runs the external compiler inside a workspace
#[derive(Debug, Clone)]
pub struct CompilerInvoker {
    config: CompilerConfig,
}

impl CompilerInvoker {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout.into()
    }

    pub fn output_file(&self) -> &str {
        &self.config.output_file
    }

    /// Writes the submitted source as the compiler's input file
    pub async fn prepare(&self, workspace: &Workspace, source: &str) -> io::Result<()> {
        tokio::fs::write(workspace.file(&self.config.input_file), source).await
    }

    /// Generates the compile command by applying template substitutions
    fn generate_compile_command(&self) -> Vec<String> {
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%INPUT%", &self.config.input_file);
        mapping.insert("%OUTPUT%", &self.config.output_file);

        self.config
            .command
            .iter()
            .map(|s| {
                let mut t = s.clone();
                for (k, v) in mapping.iter() {
                    t = t.replace(k, v);
                }
                t
            })
            .collect()
    }

    /// Runs the compiler to completion, timeout or shutdown, whichever comes first
    ///
    /// On timeout and shutdown the compiler's whole process group is killed
    /// and reaped before this returns. Output written up to that point is
    /// kept in `raw_log`.
    pub async fn run(
        &self,
        workspace: &Workspace,
        shutdown: &CancellationToken,
    ) -> Result<Invocation, SpawnError> {
        let command = self.generate_compile_command();
        let (program, args) = command.split_first().ok_or(SpawnError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let started_at = Utc::now();
        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_launch(program, e))?;
        let mut group = ProcessGroup::new(child.id());
        log::debug!(
            "Spawned `{}` (pid {:?}) in {}",
            command.join(" "),
            child.id(),
            workspace.path().display()
        );

        let max_log_bytes = self.config.max_log_bytes;
        let stdout = tokio::spawn(capture(child.stdout.take(), max_log_bytes));
        let stderr = tokio::spawn(capture(child.stderr.take(), max_log_bytes));

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => RunOutcome::Exited(status),
                Err(source) => {
                    group.kill();
                    return Err(SpawnError::Wait { program: program.clone(), source });
                }
            },
            _ = tokio::time::sleep(self.timeout()) => RunOutcome::TimedOut,
            _ = shutdown.cancelled() => RunOutcome::Aborted,
        };

        // Helpers the compiler left running would keep the pipes open. After a
        // normal exit the leader is already reaped: its id stays reserved only
        // while helpers remain in the group, an empty group answers ESRCH.
        group.kill();
        if !matches!(outcome, RunOutcome::Exited(_)) {
            if let Err(e) = child.kill().await {
                log::warn!("unable to reap compiler process: {e}");
            }
            let reason = match outcome {
                RunOutcome::TimedOut => "timeout",
                _ => "shutdown",
            };
            log::info!("Compiler killed after {:?} ({reason})", start.elapsed());
        }

        let grace: Duration = self.config.kill_grace.into();
        let mut raw_log = collect(stdout, grace).await;
        let stderr = collect(stderr, grace).await;
        if !raw_log.is_empty() && !stderr.is_empty() && !raw_log.ends_with('\n') {
            raw_log.push('\n');
        }
        raw_log.push_str(&stderr);

        Ok(Invocation {
            outcome,
            raw_log,
            started_at,
            ended_at: Utc::now(),
            elapsed: start.elapsed(),
        })
    }
}

/// Kills every process in the compiler's group, also when the run future is dropped
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match signal::killpg(pgid, Signal::SIGKILL) {
            Ok(()) => log::debug!("Killed process group {pgid}"),
            Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("unable to kill process group {pgid}: {e}"),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Drains a stream to the end, keeping at most `limit` bytes
async fn capture<R: AsyncRead + Unpin>(stream: Option<R>, limit: usize) -> Captured {
    let mut captured = Captured {
        bytes: Vec::new(),
        truncated: false,
    };
    let Some(mut stream) = stream else {
        return captured;
    };

    let mut chunk = [0u8; CAPTURE_CHUNK];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                log::warn!("error while reading compiler output: {e}");
                break;
            }
        }
    }
    captured
}

async fn collect(mut handle: JoinHandle<Captured>, grace: Duration) -> String {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(captured)) => {
            let mut text = String::from_utf8_lossy(&captured.bytes).into_owned();
            if captured.truncated {
                text.push_str("\n[output truncated]\n");
            }
            text
        }
        Ok(Err(e)) => {
            log::warn!("compiler output reader failed: {e}");
            String::new()
        }
        Err(_) => {
            handle.abort();
            log::warn!("compiler output still open {grace:?} after the process ended");
            "[output lost: stream did not close]\n".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MilliSecond;
    use crate::job::JobId;
    use crate::sandbox::WorkspaceManager;

    fn shell(script: &str, timeout_ms: u64) -> CompilerInvoker {
        CompilerInvoker::new(CompilerConfig {
            command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            timeout: MilliSecond(timeout_ms),
            ..Default::default()
        })
    }

    #[test]
    fn test_generate_compile_command() {
        let invoker = CompilerInvoker::new(CompilerConfig {
            command: ["latexmk", "-pdf", "-jobname=%OUTPUT%", "%INPUT%"]
                .map(String::from)
                .to_vec(),
            ..Default::default()
        });
        assert_eq!(
            invoker.generate_compile_command(),
            ["latexmk", "-pdf", "-jobname=main.pdf", "main.tex"]
        );
    }

    #[tokio::test]
    async fn test_run_captures_both_streams_in_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path()).unwrap();
        let workspace = manager.acquire(&JobId::new()).unwrap();

        let invoker = shell("cat %INPUT%; echo oops >&2; exit 3", 5000);
        invoker.prepare(&workspace, "hello tex").await.unwrap();

        let invocation = invoker
            .run(&workspace, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!invocation.exit_ok());
        assert!(matches!(invocation.outcome, RunOutcome::Exited(s) if s.code() == Some(3)));
        assert_eq!(invocation.raw_log, "hello tex\noops\n");
        assert!(invocation.ended_at >= invocation.started_at);
    }

    #[tokio::test]
    async fn test_run_kills_on_timeout_and_keeps_partial_log() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path()).unwrap();
        let workspace = manager.acquire(&JobId::new()).unwrap();

        let invoker = shell("echo started; sleep 30 & sleep 30", 300);
        let start = Instant::now();
        let invocation = invoker
            .run(&workspace, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(invocation.outcome, RunOutcome::TimedOut));
        assert!(invocation.raw_log.starts_with("started\n"));
        // background `sleep` holds the pipe too; the group kill closes it
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_run_aborts_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path()).unwrap();
        let workspace = manager.acquire(&JobId::new()).unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let invocation = shell("sleep 30", 10_000)
            .run(&workspace, &token)
            .await
            .unwrap();
        assert!(matches!(invocation.outcome, RunOutcome::Aborted));
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path()).unwrap();
        let workspace = manager.acquire(&JobId::new()).unwrap();

        let invoker = CompilerInvoker::new(CompilerConfig {
            command: vec!["/nonexistent/texjob-compiler".into()],
            ..Default::default()
        });
        let err = invoker
            .run(&workspace, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::NotFound { .. }));
        assert!(err.to_string().contains("/nonexistent/texjob-compiler"));
    }

    #[test]
    fn test_killing_an_empty_group_is_harmless() {
        // above any pid_max, so no such group can exist
        let mut group = ProcessGroup::new(Some(i32::MAX as u32));
        group.kill();
        assert!(group.pgid.is_none());
        group.kill();
    }

    #[tokio::test]
    async fn test_capture_is_capped() {
        let data: &[u8] = &[b'x'; 20_000];
        let captured = capture(Some(data), 100).await;
        assert_eq!(captured.bytes.len(), 100);
        assert!(captured.truncated);
    }
}
