//! Glob-style path patterns
//!
//! Supported syntax:
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `*`     | any run of characters except `/` |
//! | `?`     | any single character except `/` |
//! | `**`    | any run of characters including `/` |
//! | `[a-z]` | one character from the class (`[!..]` negates) |
//!
//! A pattern without `/` is matched against the file name only, so `*.py`
//! matches `/a/b/c.py`. Absolute patterns are anchored at the start of the
//! path; relative patterns with a `/` may match at any directory boundary.

use crate::error::{MonitorError, Result};
use crate::path::match_string;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

const WILDCARDS: &[char] = &['*', '?', '['];

/// Compiled path pattern
#[derive(Clone)]
pub struct PathPattern {
    raw: String,
    matcher: Matcher,
}

#[derive(Clone)]
enum Matcher {
    /// Whole-path string equality
    Exact(String),
    /// File-name string equality
    Name(String),
    Regex { regex: Regex, scope: Scope },
}

#[derive(Clone, Copy)]
enum Scope {
    FullPath,
    FileName,
}

/// Compile a pattern, reporting whether it contains wildcards
///
/// Literal patterns skip the regex engine entirely and compare strings.
pub fn pattern_to_matcher(pattern: &str) -> Result<(PathPattern, bool)> {
    let compiled = PathPattern::compile(pattern)?;
    let wildcards = compiled.has_wildcards();
    Ok((compiled, wildcards))
}

impl PathPattern {
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.trim().is_empty() {
            return Err(MonitorError::pattern(pattern, "pattern is empty"));
        }

        let normalized = if cfg!(windows) {
            pattern.replace('\\', "/")
        } else {
            pattern.to_string()
        };
        let by_name = !normalized.contains('/');

        let matcher = if !normalized.contains(WILDCARDS) {
            if by_name {
                Matcher::Name(normalized)
            } else {
                Matcher::Exact(normalized)
            }
        } else {
            let body = translate(&normalized).map_err(|reason| MonitorError::pattern(pattern, reason))?;
            let anchored = if by_name || normalized.starts_with('/') || is_drive_prefixed(&normalized) {
                format!("^{}$", body)
            } else {
                format!("(?:^|/){}$", body)
            };
            let regex = Regex::new(&anchored).map_err(|e| MonitorError::pattern(pattern, e.to_string()))?;
            Matcher::Regex {
                regex,
                scope: if by_name { Scope::FileName } else { Scope::FullPath },
            }
        };

        Ok(Self {
            raw: pattern.to_string(),
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(&self) -> bool {
        matches!(self.matcher, Matcher::Regex { .. })
    }

    /// Whether the pattern is matched against file names only
    pub fn matches_by_name(&self) -> bool {
        matches!(
            self.matcher,
            Matcher::Name(_)
                | Matcher::Regex {
                    scope: Scope::FileName,
                    ..
                }
        )
    }

    pub fn matches(&self, path: &Path) -> bool {
        match &self.matcher {
            Matcher::Exact(literal) => match_string(path) == *literal,
            Matcher::Name(literal) => file_name(path).is_some_and(|name| name == *literal),
            Matcher::Regex { regex, scope: Scope::FullPath } => regex.is_match(&match_string(path)),
            Matcher::Regex { regex, scope: Scope::FileName } => {
                file_name(path).is_some_and(|name| regex.is_match(&name))
            }
        }
    }

    /// Literal leading directories of an absolute pattern
    ///
    /// `/tmp/proj/**/*.py` gives `/tmp/proj`; an exact file pattern gives its
    /// parent directory. `None` for name-only and relative patterns.
    pub fn base_directory(&self) -> Option<PathBuf> {
        if self.matches_by_name() {
            return None;
        }
        let path = Path::new(&self.raw);
        if !path.is_absolute() {
            return None;
        }
        if !self.has_wildcards() {
            return path.parent().map(Path::to_path_buf);
        }
        let mut base = PathBuf::new();
        for component in path.components() {
            if component.as_os_str().to_string_lossy().contains(WILDCARDS) {
                break;
            }
            base.push(component);
        }
        Some(base)
    }

    /// Whether a match may lie more than one level below `base_directory`
    pub fn spans_subdirectories(&self) -> bool {
        if self.raw.contains("**") {
            return true;
        }
        if self.matches_by_name() {
            return true;
        }
        // A wildcard in a non-final component, e.g. `/src/*/mod.rs`
        let normalized = self.raw.replace('\\', "/");
        match normalized.rsplit_once('/') {
            Some((dirs, _)) => dirs.contains(WILDCARDS),
            None => false,
        }
    }
}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathPattern")
            .field("raw", &self.raw)
            .field("wildcards", &self.has_wildcards())
            .finish()
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn is_drive_prefixed(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

/// Translate glob syntax into a regex body (without anchors)
fn translate(pattern: &str) -> std::result::Result<String, String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    // `**/` also matches zero directories
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .enumerate()
                    .skip(1)
                    .find(|(_, c)| **c == ']')
                    .map(|(offset, _)| i + 1 + offset)
                    .ok_or_else(|| "unterminated character class".to_string())?;
                out.push('[');
                let mut j = i + 1;
                if chars[j] == '!' || chars[j] == '^' {
                    out.push('^');
                    j += 1;
                }
                for &c in &chars[j..close] {
                    if matches!(c, '\\' | '[' | '&' | '~' | '^') {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push(']');
                i = close + 1;
            }
            c => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
                i += 1;
            }
        }
    }

    Ok(out)
}
