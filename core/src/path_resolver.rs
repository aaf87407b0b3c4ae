use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use globset::GlobBuilder;
use globset::GlobMatcher;

use crate::error::Result;
use crate::error::ToolError;

/// Canonicalizes tool paths and enforces the allow/deny policy.
///
/// Immutable after construction and shared by reference between sessions.
/// Every file tool routes its path arguments through [`PathResolver::resolve`]
/// before touching the filesystem, so a denied path is never read, written,
/// or stat'd.
#[derive(Debug)]
pub struct PathResolver {
    allow_dirs: Vec<PathBuf>,
    deny_patterns: Vec<String>,
    deny_matchers: Vec<GlobMatcher>,
}

impl PathResolver {
    /// Allow directories are canonicalized eagerly; deny patterns are kept
    /// verbatim and compiled with doublestar semantics (`**` crosses path
    /// separators, `*` does not).
    pub fn new(allow_dirs: Vec<PathBuf>, deny_patterns: Vec<String>) -> Result<Self> {
        let allow_dirs = allow_dirs
            .into_iter()
            .map(|dir| {
                canonicalize_lenient(&dir).map_err(|e| {
                    ToolError::InvalidInput(format!(
                        "allow directory {} cannot be resolved: {e}",
                        dir.display()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut deny_matchers = Vec::with_capacity(deny_patterns.len());
        for pattern in &deny_patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    ToolError::InvalidInput(format!("invalid deny pattern {pattern:?}: {e}"))
                })?;
            deny_matchers.push(glob.compile_matcher());
        }

        Ok(Self {
            allow_dirs,
            deny_patterns,
            deny_matchers,
        })
    }

    pub fn allow_dirs(&self) -> &[PathBuf] {
        &self.allow_dirs
    }

    pub fn deny_patterns(&self) -> &[String] {
        &self.deny_patterns
    }

    /// Canonicalize `path` (joined to `base_cwd` when relative) and enforce
    /// the allow/deny policy on the result.
    pub fn resolve(&self, base_cwd: &Path, path: &str) -> Result<PathBuf> {
        let joined = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            base_cwd.join(path)
        };
        let canonical = canonicalize_lenient(&joined).map_err(|e| {
            ToolError::Io(format!("cannot resolve {}: {e}", joined.display()))
        })?;
        self.check(&canonical)?;
        Ok(canonical)
    }

    /// Policy check for an already-canonical path. Deny overrides allow.
    pub fn check(&self, canonical: &Path) -> Result<()> {
        if !self.allow_dirs.is_empty() {
            let allowed = self
                .allow_dirs
                .iter()
                .any(|dir| canonical == dir || canonical.starts_with(dir));
            if !allowed {
                return Err(ToolError::AccessDenied(format!(
                    "{} is outside allowed directories",
                    canonical.display()
                )));
            }
        }

        for (matcher, pattern) in self.deny_matchers.iter().zip(&self.deny_patterns) {
            // Match the path itself and every ancestor so that a pattern
            // like `**/.git` also blocks `.git/config`.
            let mut candidate = Some(canonical);
            while let Some(p) = candidate {
                if matcher.is_match(p) {
                    return Err(ToolError::AccessDenied(format!(
                        "{} matches denied pattern {pattern:?}",
                        canonical.display()
                    )));
                }
                candidate = p.parent();
            }
        }

        Ok(())
    }
}

/// Canonicalize a path that may not exist yet: resolve symlinks on the
/// longest existing prefix, then re-join the non-existent tail literally.
pub fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        normalize_lexical(path)
    } else {
        normalize_lexical(&std::env::current_dir()?.join(path))
    };

    let mut prefix = absolute.as_path();
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match prefix.canonicalize() {
            Ok(canonical) => {
                let mut out = canonical;
                for component in tail.iter().rev() {
                    out.push(component);
                }
                return Ok(out);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match (prefix.parent(), prefix.file_name()) {
                    (Some(parent), Some(name)) => {
                        tail.push(name);
                        prefix = parent;
                    }
                    _ => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Collapse `.` and `..` components without touching the filesystem, the way
/// an absolute path is cleaned before prefix resolution.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::RootDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}
