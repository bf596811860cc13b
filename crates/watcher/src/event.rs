//! Typed file system events

use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of change detected on a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    FileCreated,
    FileModified,
    FileDeleted,
    DirectoryCreated,
    DirectoryDeleted,
    SymlinkCreated,
    SymlinkDeleted,
    SymlinkTargetChanged,
}

impl EventType {
    /// Whether this event type removes the path from the tree
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            EventType::FileDeleted | EventType::DirectoryDeleted | EventType::SymlinkDeleted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::FileCreated => "file_created",
            EventType::FileModified => "file_modified",
            EventType::FileDeleted => "file_deleted",
            EventType::DirectoryCreated => "directory_created",
            EventType::DirectoryDeleted => "directory_deleted",
            EventType::SymlinkCreated => "symlink_created",
            EventType::SymlinkDeleted => "symlink_deleted",
            EventType::SymlinkTargetChanged => "symlink_target_changed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single detected change
///
/// Built by a platform monitor at detection time and never mutated afterwards.
/// `old_target`/`new_target` are only set for symlink events, and
/// `rename_counterpart` only for the two halves of a correlated rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemEvent {
    event_type: EventType,
    path: PathBuf,
    old_target: Option<PathBuf>,
    new_target: Option<PathBuf>,
    rename_counterpart: Option<PathBuf>,
}

impl FileSystemEvent {
    pub fn new(event_type: EventType, path: impl Into<PathBuf>) -> Self {
        Self {
            event_type,
            path: path.into(),
            old_target: None,
            new_target: None,
            rename_counterpart: None,
        }
    }

    /// A symlink creation pointing at `target`
    pub fn symlink_created(path: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            new_target: Some(target.into()),
            ..Self::new(EventType::SymlinkCreated, path)
        }
    }

    /// A symlink whose target changed from `old` to `new`
    pub fn symlink_target_changed(
        path: impl Into<PathBuf>,
        old: impl Into<PathBuf>,
        new: impl Into<PathBuf>,
    ) -> Self {
        Self {
            old_target: Some(old.into()),
            new_target: Some(new.into()),
            ..Self::new(EventType::SymlinkTargetChanged, path)
        }
    }

    /// Attach the other half of a rename
    pub fn with_rename_counterpart(mut self, other: impl Into<PathBuf>) -> Self {
        self.rename_counterpart = Some(other.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn old_target(&self) -> Option<&Path> {
        self.old_target.as_deref()
    }

    pub fn new_target(&self) -> Option<&Path> {
        self.new_target.as_deref()
    }

    /// For a rename, the path on the other side of the move
    pub fn rename_counterpart(&self) -> Option<&Path> {
        self.rename_counterpart.as_deref()
    }

    /// Debounce identity: events with the same key collapse into one
    pub(crate) fn debounce_key(&self) -> (PathBuf, EventType) {
        (self.path.clone(), self.event_type)
    }
}

impl fmt::Display for FileSystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.event_type, self.path.display())?;
        match (&self.old_target, &self.new_target) {
            (Some(old), Some(new)) => write!(f, " ({} -> {})", old.display(), new.display())?,
            (None, Some(new)) => write!(f, " -> {}", new.display())?,
            _ => {}
        }
        if let Some(other) = &self.rename_counterpart {
            write!(f, " [rename: {}]", other.display())?;
        }
        Ok(())
    }
}
