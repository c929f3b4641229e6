use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Identifier of a single compile job
///
/// Always generated randomly on the server; it doubles as the name of the
/// job's workspace directory, so it must never come from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl Serialize for JobId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    fn can_advance_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded | Self::Failed | Self::TimedOut)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("job {job} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub job: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Source text must contain something other than whitespace
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("missing LaTeX source")]
pub struct EmptySource;

/// One compile request and its isolated execution context
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    source: String,
    workspace: Option<PathBuf>,
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    raw_log: String,
    diagnostic: Option<String>,
}

impl Job {
    pub fn new(source: String) -> Result<Self, EmptySource> {
        if source.trim().is_empty() {
            return Err(EmptySource);
        }

        Ok(Self {
            id: JobId::new(),
            source,
            workspace: None,
            status: JobStatus::Pending,
            started_at: None,
            ended_at: None,
            raw_log: String::new(),
            diagnostic: None,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn raw_log(&self) -> &str {
        &self.raw_log
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub fn assign_workspace(&mut self, path: &Path) {
        self.workspace = Some(path.to_path_buf());
    }

    /// Moves the job forward in its lifecycle, refusing to go backwards
    pub fn advance(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_advance_to(next) {
            return Err(InvalidTransition {
                job: self.id,
                from: self.status,
                to: next,
            });
        }

        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            _ => {
                self.ended_at.get_or_insert_with(Utc::now);
            }
        }
        log::debug!("Job {} moved from {} to {next}", self.id, self.status);
        self.status = next;
        Ok(())
    }

    /// Replaces the wall-clock bounds with the ones measured around the compiler process
    pub fn record_invocation(
        &mut self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        raw_log: &str,
    ) {
        self.started_at = Some(started_at);
        self.ended_at = Some(ended_at);
        self.raw_log = raw_log.to_string();
    }

    pub fn record_diagnostic(&mut self, diagnostic: String) {
        self.diagnostic = Some(diagnostic);
    }
}
