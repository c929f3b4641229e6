pub mod diagnostic;
mod invoker;
mod package;
mod workspace;

pub use diagnostic::{Diagnostic, summarize};
pub use invoker::{CompilerInvoker, Invocation, RunOutcome, SpawnError};
pub use package::{Artifact, ArtifactError, FailureKind, FailureReport, collect};
pub use workspace::{Workspace, WorkspaceManager};
