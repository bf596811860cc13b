//! Listener that prints one line per delivered event

use fs_monitor::{EventType, Listener};
use owo_colors::OwoColorize;
use std::path::Path;

pub struct EventPrinter {
    pattern: String,
}

impl EventPrinter {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    fn print(&self, event_type: EventType, path: &Path, detail: Option<String>) -> anyhow::Result<()> {
        println!("{}", render(event_type, path, detail.as_deref()));
        Ok(())
    }
}

/// Format a single output line, colored by event kind
pub fn render(event_type: EventType, path: &Path, detail: Option<&str>) -> String {
    let label = format!("{:<22}", event_type.as_str());
    let label = match event_type {
        EventType::FileCreated | EventType::DirectoryCreated | EventType::SymlinkCreated => {
            label.green().to_string()
        }
        EventType::FileModified | EventType::SymlinkTargetChanged => label.yellow().to_string(),
        EventType::FileDeleted | EventType::DirectoryDeleted | EventType::SymlinkDeleted => {
            label.red().to_string()
        }
    };

    match detail {
        Some(detail) => format!("{} {} {}", label, path.display().cyan(), detail.dimmed()),
        None => format!("{} {}", label, path.display().cyan()),
    }
}

impl Listener for EventPrinter {
    fn path_pattern(&self) -> &str {
        &self.pattern
    }

    fn on_file_created(&self, path: &Path) -> anyhow::Result<()> {
        self.print(EventType::FileCreated, path, None)
    }

    fn on_file_modified(&self, path: &Path) -> anyhow::Result<()> {
        self.print(EventType::FileModified, path, None)
    }

    fn on_file_deleted(&self, path: &Path) -> anyhow::Result<()> {
        self.print(EventType::FileDeleted, path, None)
    }

    fn on_directory_created(&self, path: &Path) -> anyhow::Result<()> {
        self.print(EventType::DirectoryCreated, path, None)
    }

    fn on_directory_deleted(&self, path: &Path) -> anyhow::Result<()> {
        self.print(EventType::DirectoryDeleted, path, None)
    }

    fn on_symlink_created(&self, path: &Path, target: &Path) -> anyhow::Result<()> {
        self.print(EventType::SymlinkCreated, path, Some(format!("-> {}", target.display())))
    }

    fn on_symlink_deleted(&self, path: &Path) -> anyhow::Result<()> {
        self.print(EventType::SymlinkDeleted, path, None)
    }

    fn on_symlink_target_changed(
        &self,
        path: &Path,
        old_target: &Path,
        new_target: &Path,
    ) -> anyhow::Result<()> {
        let detail = format!("{} -> {}", old_target.display(), new_target.display());
        self.print(EventType::SymlinkTargetChanged, path, Some(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_kind_and_path() {
        let line = render(EventType::FileModified, Path::new("/src/lib.rs"), None);
        assert!(line.contains(EventType::FileModified.as_str()));
        assert!(line.contains("/src/lib.rs"));
    }

    #[test]
    fn test_render_symlink_detail() {
        let line = render(EventType::SymlinkCreated, Path::new("/link"), Some("-> /target"));
        assert!(line.contains("-> /target"));
    }
}
