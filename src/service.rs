use std::io;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::job::{EmptySource, Job, JobId, JobStatus};
use crate::sandbox::{
    self, Artifact, ArtifactError, CompilerInvoker, FailureKind, FailureReport, Invocation,
    RunOutcome, Workspace, WorkspaceManager,
};

/// A successfully compiled document
#[derive(Debug)]
pub struct CompiledDocument {
    pub job_id: JobId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    EmptySource(#[from] EmptySource),

    #[error("unable to prepare job workspace: {0}")]
    Workspace(#[source] io::Error),

    #[error("{}", .report.headline)]
    Failed {
        job_id: JobId,
        report: Box<FailureReport>,
    },

    #[error("compilation aborted: the service is shutting down")]
    Aborted { job_id: JobId },
}

/// Runs one job at a time per call; calls are independent of each other
pub struct CompileService {
    workspaces: WorkspaceManager,
    invoker: CompilerInvoker,
    max_artifact_bytes: u64,
    shutdown: CancellationToken,
}

impl CompileService {
    pub fn build(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let workspaces = WorkspaceManager::new(config.jobs.root_or_default())?;
        workspaces.purge_stale()?;

        Ok(Self {
            workspaces,
            invoker: CompilerInvoker::new(config.compiler.clone()),
            max_artifact_bytes: config.jobs.max_artifact_bytes,
            shutdown,
        })
    }

    pub fn job_root(&self) -> &Path {
        self.workspaces.root()
    }

    /// Compiles `source` in a fresh workspace, which is gone again when this returns
    pub async fn compile(&self, source: String) -> Result<CompiledDocument, CompileError> {
        let mut job = Job::new(source)?;
        let workspace = self
            .workspaces
            .acquire(&job.id)
            .map_err(CompileError::Workspace)?;
        job.assign_workspace(workspace.path());
        log::info!("Job {} started in {}", job.id, workspace.path().display());

        // a panic or a dropped request future releases the workspace in Drop
        let result = self.run_job(&mut job, &workspace).await;
        workspace.release().await;

        log_completion(&job, &result);
        result
    }

    async fn run_job(
        &self,
        job: &mut Job,
        workspace: &Workspace,
    ) -> Result<CompiledDocument, CompileError> {
        advance(job, JobStatus::Running);
        if let Err(e) = self.invoker.prepare(workspace, job.source()).await {
            advance(job, JobStatus::Failed);
            return Err(CompileError::Workspace(e));
        }

        let invocation = match self.invoker.run(workspace, &self.shutdown).await {
            Ok(invocation) => invocation,
            Err(e) => {
                log::error!("Job {}: {e}", job.id);
                advance(job, JobStatus::Failed);
                let report = FailureReport::new(
                    FailureKind::Spawn,
                    format!("Compiler could not be started: {e}"),
                    e.to_string(),
                    Duration::ZERO,
                );
                return Err(fail(job, report));
            }
        };
        job.record_invocation(
            invocation.started_at,
            invocation.ended_at,
            &invocation.raw_log,
        );

        match invocation.outcome {
            RunOutcome::Exited(_) if invocation.exit_ok() => {
                match self.collect_artifact(workspace).await {
                    Ok(artifact) => {
                        advance(job, JobStatus::Succeeded);
                        Ok(CompiledDocument {
                            job_id: job.id,
                            bytes: artifact.bytes,
                        })
                    }
                    Err(e) => {
                        advance(job, JobStatus::Failed);
                        Err(fail(job, missing_artifact_report(e, invocation)))
                    }
                }
            }
            RunOutcome::Exited(status) => {
                advance(job, JobStatus::Failed);
                let headline = match status.code() {
                    Some(code) => format!("Compilation failed (exit status {code})"),
                    None => format!("Compilation failed ({status})"),
                };
                let report = FailureReport::new(
                    FailureKind::Compilation,
                    headline,
                    invocation.raw_log,
                    invocation.elapsed,
                );
                Err(fail(job, report))
            }
            RunOutcome::TimedOut => {
                advance(job, JobStatus::TimedOut);
                let headline = format!(
                    "Compilation timed out after {:.1}s; the compiler was terminated",
                    self.invoker.timeout().as_secs_f64()
                );
                let report = FailureReport::new(
                    FailureKind::TimedOut,
                    headline,
                    invocation.raw_log,
                    invocation.elapsed,
                );
                Err(fail(job, report))
            }
            RunOutcome::Aborted => {
                advance(job, JobStatus::Failed);
                Err(CompileError::Aborted { job_id: job.id })
            }
        }
    }

    /// Reads the output file on the blocking pool, off the request's worker
    async fn collect_artifact(&self, workspace: &Workspace) -> Result<Artifact, ArtifactError> {
        let dir = workspace.path().to_path_buf();
        let output_file = self.invoker.output_file().to_string();
        let max_bytes = self.max_artifact_bytes;

        let name = output_file.clone();
        tokio::task::spawn_blocking(move || sandbox::collect(&dir, &output_file, max_bytes))
            .await
            .unwrap_or_else(|e| {
                Err(ArtifactError::Io {
                    name,
                    source: io::Error::other(e),
                })
            })
    }
}

fn log_completion(job: &Job, result: &Result<CompiledDocument, CompileError>) {
    if !job.status().is_terminal() {
        log::warn!("Job {} finished while still {}", job.id, job.status());
    }

    let elapsed_ms = match (job.started_at(), job.ended_at()) {
        (Some(start), Some(end)) => (end - start).num_milliseconds(),
        _ => 0,
    };
    let workspace = job
        .workspace()
        .map(|path| path.display().to_string())
        .unwrap_or_default();

    match result {
        Ok(document) => log::info!(
            "Job {} {} in {elapsed_ms} ms with {} bytes of output",
            job.id,
            job.status(),
            document.bytes.len()
        ),
        Err(e) => {
            log::info!("Job {} {} in {elapsed_ms} ms: {e}", job.id, job.status());
            if let Some(diagnostic) = job.diagnostic() {
                log::debug!("Job {} diagnostic:\n{diagnostic}", job.id);
            }
        }
    }
    log::debug!(
        "Job {} released {workspace}; raw log of {} bytes:\n{}",
        job.id,
        job.raw_log().len(),
        job.raw_log()
    );
}

fn missing_artifact_report(err: ArtifactError, invocation: Invocation) -> FailureReport {
    if matches!(err, ArtifactError::Io { .. } | ArtifactError::TooLarge { .. }) {
        log::warn!("Compiler output rejected: {err}");
    }
    FailureReport::new(
        FailureKind::MissingArtifact,
        err.to_string(),
        invocation.raw_log,
        invocation.elapsed,
    )
}

fn fail(job: &mut Job, report: FailureReport) -> CompileError {
    job.record_diagnostic(report.summary());
    CompileError::Failed {
        job_id: job.id,
        report: Box::new(report),
    }
}

fn advance(job: &mut Job, status: JobStatus) {
    if let Err(e) = job.advance(status) {
        log::error!("{e}");
    }
}
