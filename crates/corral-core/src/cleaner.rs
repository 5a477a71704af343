//! Deferred cleanup actions run after a sandbox starts or stops.

use std::fmt;
use std::io;
use std::path::PathBuf;

type Callback = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// When an action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStage {
    /// After the domain started (or failed to).
    PostStart,
    /// After the domain stopped (or failed to start).
    PostStop,
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PostStart => write!(f, "post-start"),
            Self::PostStop => write!(f, "post-stop"),
        }
    }
}

enum Action {
    RemoveFile(PathBuf),
    RemoveDir(PathBuf),
    Callback { label: String, f: Callback },
}

impl Action {
    fn run(self) -> io::Result<()> {
        match self {
            Self::RemoveFile(path) => ignore_missing(std::fs::remove_file(path)),
            Self::RemoveDir(path) => ignore_missing(std::fs::remove_dir(path)),
            Self::Callback { f, .. } => f(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::RemoveFile(path) => format!("remove file {}", path.display()),
            Self::RemoveDir(path) => format!("remove dir {}", path.display()),
            Self::Callback { label, .. } => label.clone(),
        }
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Ordered lists of cleanup actions.
///
/// Running a stage drains its list, so every action runs at most once.
/// Actions run in registration order; a failing action is logged and does
/// not stop the ones after it.
#[derive(Default)]
pub struct Cleaner {
    post_start: Vec<Action>,
    post_stop: Vec<Action>,
}

impl Cleaner {
    /// Create an empty cleaner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a file at `stage`. A missing file is not an error.
    pub fn add_rmfile(&mut self, stage: CleanupStage, path: impl Into<PathBuf>) {
        self.list(stage).push(Action::RemoveFile(path.into()));
    }

    /// Remove an empty directory at `stage`. A missing directory is not an error.
    pub fn add_rmdir(&mut self, stage: CleanupStage, path: impl Into<PathBuf>) {
        self.list(stage).push(Action::RemoveDir(path.into()));
    }

    /// Run an arbitrary action at `stage`.
    pub fn add_callback<F>(&mut self, stage: CleanupStage, label: impl Into<String>, f: F)
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        self.list(stage).push(Action::Callback {
            label: label.into(),
            f: Box::new(f),
        });
    }

    /// Number of actions waiting at `stage`.
    pub fn pending(&self, stage: CleanupStage) -> usize {
        match stage {
            CleanupStage::PostStart => self.post_start.len(),
            CleanupStage::PostStop => self.post_stop.len(),
        }
    }

    /// Run and drain the actions of `stage`. Returns `false` if any failed.
    pub fn run(&mut self, stage: CleanupStage) -> bool {
        let actions = std::mem::take(self.list(stage));
        let mut ok = true;
        for action in actions {
            let what = action.describe();
            match action.run() {
                Ok(()) => tracing::trace!(%stage, action = %what, "Cleanup done"),
                Err(e) => {
                    tracing::warn!(%stage, action = %what, error = %e, "Cleanup failed");
                    ok = false;
                }
            }
        }
        ok
    }

    fn list(&mut self, stage: CleanupStage) -> &mut Vec<Action> {
        match stage {
            CleanupStage::PostStart => &mut self.post_start,
            CleanupStage::PostStop => &mut self.post_stop,
        }
    }
}

impl fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleaner")
            .field("post_start", &self.post_start.len())
            .field("post_stop", &self.post_stop.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_in_order_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("state");
        let file = sub.join("sandbox.cfg");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(&file, "{}").unwrap();

        let mut cleaner = Cleaner::new();
        cleaner.add_rmfile(CleanupStage::PostStop, &file);
        cleaner.add_rmdir(CleanupStage::PostStop, &sub);
        assert_eq!(cleaner.pending(CleanupStage::PostStop), 2);
        assert_eq!(cleaner.pending(CleanupStage::PostStart), 0);

        assert!(cleaner.run(CleanupStage::PostStop));
        assert!(!sub.exists());
        assert_eq!(cleaner.pending(CleanupStage::PostStop), 0);
        assert!(cleaner.run(CleanupStage::PostStop));
    }

    #[test]
    fn test_failure_does_not_stop_later_actions() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut cleaner = Cleaner::new();
        cleaner.add_callback(CleanupStage::PostStart, "fail", || {
            Err(io::Error::other("boom"))
        });
        let c = counter.clone();
        cleaner.add_callback(CleanupStage::PostStart, "count", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(!cleaner.run(CleanupStage::PostStart));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_paths_are_fine() {
        let mut cleaner = Cleaner::new();
        cleaner.add_rmfile(CleanupStage::PostStop, "/nonexistent/corral/file");
        cleaner.add_rmdir(CleanupStage::PostStop, "/nonexistent/corral/dir");
        assert!(cleaner.run(CleanupStage::PostStop));
    }

    #[test]
    fn test_non_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep"), "x").unwrap();
        let mut cleaner = Cleaner::new();
        cleaner.add_rmdir(CleanupStage::PostStop, dir.path());
        assert!(!cleaner.run(CleanupStage::PostStop));
    }
}
