use std::fmt::Write as _;
use std::time::SystemTime;

use globset::GlobBuilder;
use ignore::WalkBuilder;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::error::ToolError;
use crate::session::Session;

#[derive(Debug, Clone, Default)]
pub struct GlobParams {
    pub pattern: String,
    /// Search root; defaults to the session cwd.
    pub path: Option<String>,
    /// Restrict matches to `file` or `directory`.
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeFilter {
    File,
    Directory,
}

/// Doublestar path matching over a gitignore-aware walk, newest first.
pub fn glob(config: &ServerConfig, session: &Session, params: GlobParams) -> Result<String> {
    let type_filter = match params.kind.as_deref() {
        None => None,
        Some("file") => Some(TypeFilter::File),
        Some("directory") => Some(TypeFilter::Directory),
        Some(other) => {
            return Err(ToolError::GlobInvalidType(format!(
                "unknown type {other:?}; expected file or directory"
            )));
        }
    };

    let matcher = GlobBuilder::new(&params.pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| {
            ToolError::GlobInvalidPattern(format!("cannot compile {:?}: {e}", params.pattern))
        })?
        .compile_matcher();

    let cwd = session.cwd();
    let root = config
        .resolver
        .resolve(&cwd, params.path.as_deref().unwrap_or("."))?;

    let mut walker = WalkBuilder::new(&root);
    walker
        .hidden(false)
        .sort_by_file_path(|a, b| a.cmp(b))
        .filter_entry(|entry| entry.file_name() != std::ffi::OsStr::new(".git"));

    let mut matches: Vec<(SystemTime, String)> = Vec::new();
    for entry in walker.build() {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path == root {
            continue;
        }
        if config.resolver.check(path).is_err() {
            continue;
        }

        let relative = path.strip_prefix(&root).unwrap_or(path);
        if !matcher.is_match(relative) && !matcher.is_match(path) {
            continue;
        }
        let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
        match type_filter {
            Some(TypeFilter::File) if is_dir => continue,
            Some(TypeFilter::Directory) if !is_dir => continue,
            _ => {}
        }

        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        matches.push((modified, path.display().to_string()));
    }

    if matches.is_empty() {
        return Ok("No matches found.".to_string());
    }

    // Newest first; ties break on path for a stable order.
    matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut out = String::new();
    for (_, path) in matches {
        let _ = writeln!(out, "{path}");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use crate::tools::test_support::config_for;

    use super::*;

    fn setup() -> (TempDir, ServerConfig, Session) {
        let dir = TempDir::new().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let config = config_for(&base);
        let session = Session::new(base);
        (dir, config, session)
    }

    fn run(config: &ServerConfig, session: &Session, pattern: &str, kind: Option<&str>) -> String {
        glob(
            config,
            session,
            GlobParams {
                pattern: pattern.to_string(),
                path: None,
                kind: kind.map(String::from),
            },
        )
        .unwrap()
    }

    #[test]
    fn doublestar_crosses_directories_but_star_does_not() {
        let (_dir, config, session) = setup();
        let base = session.cwd();
        std::fs::create_dir_all(base.join("src/nested")).unwrap();
        std::fs::write(base.join("top.rs"), "").unwrap();
        std::fs::write(base.join("src/lib.rs"), "").unwrap();
        std::fs::write(base.join("src/nested/deep.rs"), "").unwrap();

        let out = run(&config, &session, "**/*.rs", None);
        assert!(out.contains("top.rs"));
        assert!(out.contains("lib.rs"));
        assert!(out.contains("deep.rs"));

        let out = run(&config, &session, "*.rs", None);
        assert!(out.contains("top.rs"));
        assert!(!out.contains("lib.rs"));
    }

    #[test]
    fn type_filter_restricts_matches() {
        let (_dir, config, session) = setup();
        let base = session.cwd();
        std::fs::create_dir(base.join("thing")).unwrap();
        std::fs::write(base.join("thing.txt"), "").unwrap();

        let out = run(&config, &session, "thing*", Some("directory"));
        assert!(out.contains("thing"));
        assert!(!out.contains("thing.txt"));

        let out = run(&config, &session, "thing*", Some("file"));
        assert!(out.contains("thing.txt"));
    }

    #[test]
    fn invalid_pattern_and_type_are_rejected() {
        let (_dir, config, session) = setup();
        let err = glob(
            &config,
            &session,
            GlobParams {
                pattern: "a[".to_string(),
                ..GlobParams::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "GLOB_INVALID_PATTERN");

        let err = glob(
            &config,
            &session,
            GlobParams {
                pattern: "*".to_string(),
                kind: Some("symlink".to_string()),
                ..GlobParams::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "GLOB_INVALID_TYPE");
    }

    #[test]
    fn results_are_sorted_newest_first() {
        let (_dir, config, session) = setup();
        let base = session.cwd();
        std::fs::write(base.join("older.txt"), "").unwrap();
        std::fs::write(base.join("newer.txt"), "").unwrap();
        // Force distinct mtimes without sleeping.
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let file = std::fs::File::options()
            .write(true)
            .open(base.join("older.txt"))
            .unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let out = run(&config, &session, "*.txt", None);
        let newer_pos = out.find("newer.txt").unwrap();
        let older_pos = out.find("older.txt").unwrap();
        assert!(newer_pos < older_pos, "newest should come first:\n{out}");
    }

    #[test]
    fn gitignored_paths_are_excluded() {
        let (_dir, config, session) = setup();
        let base = session.cwd();
        std::fs::create_dir(base.join(".git")).unwrap();
        std::fs::write(base.join(".gitignore"), "build/\n").unwrap();
        std::fs::create_dir(base.join("build")).unwrap();
        std::fs::write(base.join("build/out.txt"), "").unwrap();
        std::fs::write(base.join("src.txt"), "").unwrap();

        let out = run(&config, &session, "**/*.txt", None);
        assert!(out.contains("src.txt"));
        assert!(!out.contains("out.txt"));
    }

    #[test]
    fn denied_paths_are_skipped() {
        let (_dir, mut config, session) = setup();
        let base = session.cwd();
        std::fs::write(base.join("visible.txt"), "").unwrap();
        std::fs::write(base.join("secret.pem"), "").unwrap();
        config.resolver = std::sync::Arc::new(
            crate::path_resolver::PathResolver::new(vec![], vec!["**/*.pem".to_string()]).unwrap(),
        );

        let out = run(&config, &session, "*", None);
        assert!(out.contains("visible.txt"));
        assert!(!out.contains("secret.pem"));
    }

    #[test]
    fn no_matches_is_a_friendly_message() {
        let (_dir, config, session) = setup();
        let out = run(&config, &session, "*.zig", None);
        assert_eq!(out, "No matches found.");
    }

    #[test]
    fn matches_are_reported_as_absolute_paths() {
        let (_dir, config, session) = setup();
        let base = session.cwd();
        std::fs::write(base.join("abs.txt"), "").unwrap();

        let out = run(&config, &session, "abs.txt", None);
        assert_eq!(out.trim_end(), base.join("abs.txt").display().to_string());
        assert!(Path::new(out.trim_end()).is_absolute());
    }
}
