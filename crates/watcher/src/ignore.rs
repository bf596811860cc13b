//! Ignore rules applied before events reach the dispatcher
//!
//! Three sources, checked in order:
//! 1. Built-in rules (VCS metadata directories, editor temp files, OS
//!    metadata files) - always active
//! 2. `ignore_patterns` from the monitor configuration
//! 3. `<project_root>/.gitignore` when `use_gitignore` is enabled
//!
//! Log files are handled separately by [`crate::path::is_log_file`] and are
//! never configurable.

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Component, Path, PathBuf};

/// Directories whose contents are never reported
const BUILTIN_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// Compiled ignore rules for one monitor instance
pub struct IgnoreRules {
    root: PathBuf,
    patterns: Option<Gitignore>,
    gitignore: Option<Gitignore>,
}

impl IgnoreRules {
    /// Build ignore rules for a project root
    pub fn load(project_root: &Path, config: &MonitorConfig) -> Result<Self> {
        let patterns = if config.ignore_patterns.is_empty() {
            None
        } else {
            let mut builder = GitignoreBuilder::new(project_root);
            for pattern in &config.ignore_patterns {
                builder.add_line(None, pattern).map_err(|e| {
                    MonitorError::Config(format!("invalid ignore pattern '{}': {}", pattern, e))
                })?;
            }
            Some(builder.build().map_err(|e| MonitorError::Config(e.to_string()))?)
        };

        let gitignore = if config.use_gitignore {
            let gitignore_path = project_root.join(".gitignore");
            if gitignore_path.exists() {
                let mut builder = GitignoreBuilder::new(project_root);
                if let Some(e) = builder.add(&gitignore_path) {
                    tracing::warn!("Partially read {}: {}", gitignore_path.display(), e);
                }
                Some(builder.build().map_err(|e| MonitorError::Config(e.to_string()))?)
            } else {
                None
            }
        } else {
            None
        };

        Ok(Self {
            root: project_root.to_path_buf(),
            patterns,
            gitignore,
        })
    }

    /// Rules with only the built-in set
    pub fn builtin(project_root: &Path) -> Self {
        Self {
            root: project_root.to_path_buf(),
            patterns: None,
            gitignore: None,
        }
    }

    /// Check if an event for `path` should be dropped
    ///
    /// `is_dir` is a hint from the caller; for deleted paths the file system
    /// can no longer answer it.
    pub fn should_ignore(&self, path: &Path, is_dir: bool) -> bool {
        if is_builtin_ignored(path) {
            return true;
        }

        for rules in [&self.patterns, &self.gitignore].into_iter().flatten() {
            if self.matched(rules, path, is_dir) {
                return true;
            }
        }

        false
    }

    /// Number of active rule sources (built-in always counts)
    pub fn active_sources(&self) -> usize {
        1 + usize::from(self.patterns.is_some()) + usize::from(self.gitignore.is_some())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn matched(&self, rules: &Gitignore, path: &Path, is_dir: bool) -> bool {
        match path.strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rules
                .matched_path_or_any_parents(rel, is_dir)
                .is_ignore(),
            _ => match path.file_name() {
                // Outside the project only unanchored (name) patterns apply
                Some(name) => rules.matched(Path::new(name), is_dir).is_ignore(),
                None => false,
            },
        }
    }
}

fn is_builtin_ignored(path: &Path) -> bool {
    let in_vcs_dir = path.components().any(|c| match c {
        Component::Normal(seg) => BUILTIN_DIRS.iter().any(|d| seg == *d),
        _ => false,
    });
    if in_vcs_dir {
        return true;
    }

    path.file_name()
        .and_then(|n| n.to_str())
        .map(is_editor_temp)
        .unwrap_or(false)
}

/// Editor swap/backup files and OS metadata files
///
/// Covers: Vim, Emacs, JetBrains safe-write, macOS and Windows system files
fn is_editor_temp(filename: &str) -> bool {
    // Vim swap files (.swp, .swo, .swn, .swx)
    if filename.ends_with(".swp")
        || filename.ends_with(".swo")
        || filename.ends_with(".swn")
        || filename.ends_with(".swx")
    {
        return true;
    }

    // Vim write-permission probe file
    if filename == "4913" {
        return true;
    }

    // Vim/Emacs backup files (~)
    if filename.ends_with('~') {
        return true;
    }

    // Emacs auto-save (#*#) and lock files (.#*)
    if (filename.starts_with('#') && filename.ends_with('#')) || filename.starts_with(".#") {
        return true;
    }

    // JetBrains safe-write temp files
    if filename.ends_with("___jb_tmp___") || filename.ends_with("___jb_old___") {
        return true;
    }

    // macOS and Windows system files
    filename == ".DS_Store" || filename.starts_with("._") || filename == "Thumbs.db" || filename == "desktop.ini"
}
