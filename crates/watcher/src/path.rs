//! Path resolution and classification helpers

use crate::error::{MonitorError, Result};
use std::path::{Component, Path, PathBuf};

/// Resolve a path to absolute form
///
/// - `~` and `~/...` expand to the home directory
/// - absolute paths are returned unchanged (lexically normalized)
/// - relative paths resolve against the Git root found above `base`
///   (or the current directory when `base` is `None`), falling back to
///   the current directory when no Git root exists
pub fn resolve(path: &Path, base: Option<&Path>) -> Result<PathBuf> {
    let expanded = expand_tilde(path)?;
    if expanded.is_absolute() {
        return Ok(normalize_lexically(&expanded));
    }

    let cwd = std::env::current_dir();
    let search_from = match (base, &cwd) {
        (Some(base), _) => Some(base.to_path_buf()),
        (None, Ok(cwd)) => Some(cwd.clone()),
        (None, Err(_)) => None,
    };

    if let Some(root) = search_from.as_deref().and_then(find_git_root) {
        return Ok(normalize_lexically(&root.join(&expanded)));
    }

    match cwd {
        Ok(cwd) => Ok(normalize_lexically(&cwd.join(&expanded))),
        Err(e) => Err(MonitorError::PathResolution {
            path: path.to_path_buf(),
            reason: format!("no Git root and no current directory: {}", e),
        }),
    }
}

/// Walk up from `start` looking for a `.git` marker (directory or file)
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".git").exists() {
            return Some(current);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => {
            let home = dirs::home_dir().ok_or_else(|| MonitorError::PathResolution {
                path: path.to_path_buf(),
                reason: "home directory is unknown".to_string(),
            })?;
            Ok(home.join(components.as_path()))
        }
        _ => Ok(path.to_path_buf()),
    }
}

/// Collapse `.` and `..` without touching the file system
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Path rendered with `/` separators for pattern matching
pub fn match_string(path: &Path) -> String {
    let s = path.to_string_lossy();
    if cfg!(windows) {
        s.replace('\\', "/")
    } else {
        s.into_owned()
    }
}

/// Whether a path looks like log output
///
/// Matches `*.log`, rotated logs (`app.log.1`, `app.log.2024-01-01`,
/// `app.log.gz`) and anything below a `log`/`logs` directory. Monitors drop
/// these events unconditionally so their own log output cannot feed back
/// into them.
pub fn is_log_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();

    if lower.ends_with(".log") || lower.contains(".log.") {
        return true;
    }

    path.parent()
        .map(|parent| {
            parent.components().any(|c| match c {
                Component::Normal(seg) => {
                    let seg = seg.to_string_lossy();
                    seg.eq_ignore_ascii_case("log") || seg.eq_ignore_ascii_case("logs")
                }
                _ => false,
            })
        })
        .unwrap_or(false)
}
