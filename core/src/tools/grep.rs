use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use ignore::WalkBuilder;
use regex::RegexBuilder;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::error::ToolError;
use crate::session::Session;

/// Cap applied when the caller does not pass `max_results`.
const DEFAULT_MAX_RESULTS: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct GrepParams {
    pub pattern: String,
    /// Search root; defaults to the session cwd. May name a single file.
    pub path: Option<String>,
    /// `content` (default), `files_with_matches`, or `count`.
    pub output_mode: Option<String>,
    pub case_insensitive: bool,
    /// Prefix content lines with `line:`; on by default at the tool layer.
    pub line_numbers: bool,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Content,
    FilesWithMatches,
    Count,
}

/// Regex content search over a gitignore-aware walk.
///
/// Files the resolver denies are skipped silently; only the search root
/// itself surfaces an ACCESS_DENIED error. Binary files (NUL in the first
/// 512 bytes) are skipped.
pub fn grep(config: &ServerConfig, session: &Session, params: GrepParams) -> Result<String> {
    let mode = match params.output_mode.as_deref() {
        None | Some("content") => OutputMode::Content,
        Some("files_with_matches") => OutputMode::FilesWithMatches,
        Some("count") => OutputMode::Count,
        Some(other) => {
            return Err(ToolError::GrepInvalidOutputMode(format!(
                "unknown output mode {other:?}; expected content, files_with_matches, or count"
            )));
        }
    };

    let regex = RegexBuilder::new(&params.pattern)
        .case_insensitive(params.case_insensitive)
        .build()
        .map_err(|e| ToolError::GrepInvalidPattern(format!("cannot compile {:?}: {e}", params.pattern)))?;

    let cwd = session.cwd();
    let root = config
        .resolver
        .resolve(&cwd, params.path.as_deref().unwrap_or("."))?;
    let max_results = params.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

    let mut out = String::new();
    let mut results = 0usize;
    let mut truncated = false;

    for file in walk_files(config, &root) {
        if results >= max_results {
            truncated = true;
            break;
        }
        let Some(content) = read_text(&file) else {
            continue;
        };

        match mode {
            OutputMode::Content => {
                for (idx, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        let shown = display_path(&file, &root);
                        if params.line_numbers {
                            let _ = writeln!(out, "{shown}:{}:{line}", idx + 1);
                        } else {
                            let _ = writeln!(out, "{shown}:{line}");
                        }
                        results += 1;
                        if results >= max_results {
                            truncated = true;
                            break;
                        }
                    }
                }
            }
            OutputMode::FilesWithMatches => {
                if content.lines().any(|line| regex.is_match(line)) {
                    let _ = writeln!(out, "{}", display_path(&file, &root));
                    results += 1;
                }
            }
            OutputMode::Count => {
                let count = content.lines().filter(|line| regex.is_match(line)).count();
                if count > 0 {
                    let _ = writeln!(out, "{}:{count}", display_path(&file, &root));
                    results += 1;
                }
            }
        }
    }

    if out.is_empty() {
        return Ok("No matches found.".to_string());
    }
    if truncated {
        let _ = writeln!(out, "[results truncated at {max_results}]");
    }
    Ok(out)
}

/// Deterministic gitignore-aware file walk under `root`, silently dropping
/// anything the resolver denies. Dotfiles are included; `.git` itself is
/// not.
pub(crate) fn walk_files(config: &ServerConfig, root: &Path) -> Vec<PathBuf> {
    let mut walker = WalkBuilder::new(root);
    walker
        .hidden(false)
        .sort_by_file_path(|a, b| a.cmp(b))
        .filter_entry(|entry| entry.file_name() != std::ffi::OsStr::new(".git"));

    let mut files = Vec::new();
    for entry in walker.build() {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.into_path();
        if config.resolver.check(&path).is_err() {
            continue;
        }
        files.push(path);
    }
    files
}

/// Read a file as text, returning `None` for unreadable or binary content.
pub(crate) fn read_text(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    if bytes.iter().take(512).any(|&b| b == 0) {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn display_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .ok()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
