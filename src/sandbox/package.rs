use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use super::diagnostic::{Diagnostic, summarize};

/// A compiled document, read out of the workspace before it is removed
#[derive(Debug)]
pub struct Artifact {
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("No PDF output generated: `{0}` does not exist")]
    Missing(String),

    #[error("No PDF output generated: `{0}` is empty")]
    Empty(String),

    #[error("No PDF output generated: `{0}` is not a regular file")]
    NotAFile(String),

    #[error("output `{name}` is {size} bytes, above the {limit} byte limit")]
    TooLarge { name: String, size: u64, limit: u64 },

    #[error("unable to read output `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Locates the fixed output file and reads it fully, refusing anything but a
/// non-empty regular file below `max_bytes`
///
/// Blocking; the service runs it on tokio's blocking pool.
pub fn collect(
    workspace_dir: &Path,
    output_file: &str,
    max_bytes: u64,
) -> Result<Artifact, ArtifactError> {
    let name = output_file.to_string();
    let path = workspace_dir.join(output_file);
    let io_error = |source| ArtifactError::Io {
        name: output_file.to_string(),
        source,
    };

    // symlink_metadata: a link planted by the document must not be followed
    let metadata = match fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ArtifactError::Missing(name));
        }
        Err(e) => return Err(io_error(e)),
    };
    if !metadata.is_file() {
        return Err(ArtifactError::NotAFile(name));
    }
    if metadata.len() == 0 {
        return Err(ArtifactError::Empty(name));
    }
    if metadata.len() > max_bytes {
        return Err(ArtifactError::TooLarge {
            name,
            size: metadata.len(),
            limit: max_bytes,
        });
    }

    let mut bytes = Vec::with_capacity(metadata.len() as usize);
    fs::File::open(&path)
        .and_then(|file| file.take(max_bytes + 1).read_to_end(&mut bytes))
        .map_err(io_error)?;

    // the file may have changed between stat and read
    if bytes.is_empty() {
        return Err(ArtifactError::Empty(name));
    }
    if bytes.len() as u64 > max_bytes {
        return Err(ArtifactError::TooLarge {
            name,
            size: bytes.len() as u64,
            limit: max_bytes,
        });
    }

    Ok(Artifact { bytes })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The compiler exited with a non-zero status
    Compilation,
    /// The compiler reported success but left no usable output
    MissingArtifact,
    /// The compiler was killed after the timeout
    TimedOut,
    /// The compiler could not be started at all
    Spawn,
}

/// What the caller gets back instead of a document
#[derive(Debug)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub headline: String,
    pub diagnostic: Diagnostic,
    pub raw_log: String,
    pub elapsed: Duration,
}

impl FailureReport {
    pub fn new(kind: FailureKind, headline: String, raw_log: String, elapsed: Duration) -> Self {
        let mut diagnostic = summarize(&raw_log);
        if kind == FailureKind::Spawn {
            // the "log" is our own launch error, there is nothing to scan
            diagnostic = Diagnostic::default();
        }

        Self {
            kind,
            headline,
            diagnostic,
            raw_log,
            elapsed,
        }
    }

    /// Headline plus the extracted errors; never empty
    pub fn summary(&self) -> String {
        if self.kind == FailureKind::Spawn {
            return self.headline.clone();
        }
        format!("{}\n\n{}", self.headline, self.diagnostic)
    }

    /// Summary followed by the verbatim compiler output
    pub fn error_log(&self) -> String {
        let rule = "=============================";
        let raw_log = if self.raw_log.trim().is_empty() {
            "(the compiler produced no output)"
        } else {
            &self.raw_log
        };
        format!("{}\n\n{rule}\nRAW LOG:\n{rule}\n{raw_log}", self.summary())
    }
}
