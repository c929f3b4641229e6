use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::job::JobId;

// Workspaces, and a job root created by the service, are private to its user
const WORKSPACE_PERMISSIONS: u32 = 0o700;
const WORKSPACE_PREFIX: &str = "job-";

/// Hands out one private directory per job under a shared job root
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Opens the job root, creating it (and missing parents) as 0700
    ///
    /// An existing directory keeps its permissions: the root may be shared,
    /// only the workspaces inside it are private.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        fs::DirBuilder::new()
            .recursive(true)
            .mode(WORKSPACE_PERMISSIONS)
            .create(root)?;
        let root = root.canonicalize()?;

        log::info!("Job root ready at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh workspace for the given job
    ///
    /// The directory is created exclusively: if the name somehow exists
    /// already, this fails instead of handing out a directory another job
    /// may be using.
    pub fn acquire(&self, job_id: &JobId) -> io::Result<Workspace> {
        let path = self.root.join(format!("{WORKSPACE_PREFIX}{job_id}"));
        fs::DirBuilder::new()
            .mode(WORKSPACE_PERMISSIONS)
            .create(&path)?;

        log::debug!("Acquired workspace {}", path.display());
        Ok(Workspace {
            path,
            released: false,
        })
    }

    /// Removes workspaces left behind by a previous run of the service
    pub fn purge_stale(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let is_workspace = entry.file_name().to_str().is_some_and(is_workspace_name);
            if !is_workspace || !entry.file_type()?.is_dir() {
                continue;
            }

            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    "unable to remove stale workspace {}: {e}",
                    entry.path().display()
                ),
            }
        }

        if removed > 0 {
            log::info!("Removed {removed} stale workspaces from {}", self.root.display());
        }
        Ok(removed)
    }
}

/// `job-` followed by a job id, i.e. a name `acquire` could have produced
fn is_workspace_name(name: &str) -> bool {
    name.strip_prefix(WORKSPACE_PREFIX).is_some_and(|id| {
        id.len() == 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    })
}

/// A job's private directory, removed exactly once when released or dropped
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file directly inside the workspace
    ///
    /// `name` comes from validated configuration and is a plain file name.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Removes the directory on the blocking pool, off the async workers
    pub async fn release(mut self) {
        let path = self.path.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || self.remove()).await {
            log::error!("Releasing workspace {} failed: {e}", path.display());
        }
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("Released workspace {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("Workspace {} was already gone", self.path.display())
            }
            Err(e) => log::warn!(
                "unable to remove workspace {}: {e}",
                self.path.display()
            ),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn entries(root: &Path) -> usize {
        fs::read_dir(root).unwrap().count()
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[tokio::test]
    async fn test_acquire_creates_private_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path().join("cache/jobs")).unwrap();
        assert_eq!(mode(manager.root()), 0o700);

        let id = JobId::new();
        let workspace = manager.acquire(&id).unwrap();
        assert!(workspace.path().is_dir());
        assert!(workspace.path().starts_with(manager.root()));
        assert!(workspace.path().ends_with(format!("job-{id}")));
        assert_eq!(mode(workspace.path()), 0o700);

        workspace.release().await;
        assert_eq!(entries(manager.root()), 0);
    }

    #[test]
    fn test_existing_root_keeps_its_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = tmp.path().join("shared");
        fs::create_dir(&shared).unwrap();
        fs::set_permissions(&shared, fs::Permissions::from_mode(0o1777)).unwrap();

        let manager = WorkspaceManager::new(&shared).unwrap();
        assert_eq!(mode(manager.root()), 0o1777);

        let workspace = manager.acquire(&JobId::new()).unwrap();
        assert_eq!(mode(workspace.path()), 0o700);
    }

    #[test]
    fn test_acquire_never_shares_a_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path()).unwrap();

        let id = JobId::new();
        let _first = manager.acquire(&id).unwrap();
        let err = manager.acquire(&id).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_release_tolerates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path()).unwrap();

        let workspace = manager.acquire(&JobId::new()).unwrap();
        fs::write(workspace.file("main.tex"), "x").unwrap();
        fs::remove_dir_all(workspace.path()).unwrap();

        workspace.release().await;
        assert_eq!(entries(manager.root()), 0);
    }

    #[test]
    fn test_drop_removes_workspace_on_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path()).unwrap();

        let result = std::panic::catch_unwind(|| {
            let workspace = manager.acquire(&JobId::new()).unwrap();
            fs::create_dir(workspace.file("nested")).unwrap();
            fs::write(workspace.path().join("nested/main.aux"), "x").unwrap();
            panic!("injected fault");
        });

        assert!(result.is_err());
        assert_eq!(entries(manager.root()), 0);
    }

    #[test]
    fn test_purge_stale_only_touches_own_workspaces() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path()).unwrap();

        let leftover = manager.root().join(format!("job-{}", JobId::new()));
        fs::create_dir(&leftover).unwrap();
        fs::write(leftover.join("main.tex"), "x").unwrap();
        fs::create_dir(manager.root().join("job-other-app")).unwrap();
        fs::create_dir(manager.root().join("keep-me")).unwrap();
        fs::write(manager.root().join(format!("job-{}", JobId::new())), "x").unwrap();

        assert_eq!(manager.purge_stale().unwrap(), 1);
        assert!(!leftover.exists());
        assert!(manager.root().join("job-other-app").exists());
        assert!(manager.root().join("keep-me").exists());
        assert_eq!(entries(manager.root()), 3);
    }

    #[test]
    fn test_workspace_names() {
        assert!(is_workspace_name(&format!("job-{}", JobId::new())));
        assert!(!is_workspace_name("job-other-app"));
        assert!(!is_workspace_name("job-0123456789ABCDEF0123456789ABCDEF"));
        assert!(!is_workspace_name("job-"));
    }
}
