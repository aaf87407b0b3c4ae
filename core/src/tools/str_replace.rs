use std::fs;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::error::ToolError;
use crate::session::Session;
use crate::tools::push_numbered_line;

/// Lines of context shown on each side of the replacement in the snippet.
const SNIPPET_CONTEXT_LINES: u64 = 4;

/// Replace `old_str` in a file, requiring it to be unique unless
/// `replace_all` is set. The file's mode bits survive the rewrite, and the
/// confirmation includes a numbered snippet around the first replacement.
///
/// Operates on raw bytes so non-UTF-8 content outside the replaced region is
/// preserved untouched.
pub fn str_replace(
    config: &ServerConfig,
    session: &Session,
    path: &str,
    old_str: &str,
    new_str: Option<&str>,
    replace_all: bool,
) -> Result<String> {
    let resolved = config.resolver.resolve(&session.cwd(), path)?;
    let meta = fs::metadata(&resolved).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            ToolError::PathNotFound(format!("{} does not exist", resolved.display()))
        }
        _ => ToolError::Io(format!("cannot stat {}: {e}", resolved.display())),
    })?;
    if meta.is_dir() {
        return Err(ToolError::InvalidInput(format!(
            "{} is a directory",
            resolved.display()
        )));
    }
    if config.require_view_before_edit && !session.has_viewed(&resolved) {
        return Err(ToolError::FileNotViewed(format!(
            "view {} before editing it",
            resolved.display()
        )));
    }
    if old_str.is_empty() {
        return Err(ToolError::InvalidInput(
            "old_str must not be empty".to_string(),
        ));
    }

    let content = fs::read(&resolved)
        .map_err(|e| ToolError::Io(format!("cannot read {}: {e}", resolved.display())))?;
    let old = old_str.as_bytes();
    let new = new_str.unwrap_or("").as_bytes();

    let count = count_occurrences(&content, old);
    if count == 0 {
        return Err(ToolError::StrReplaceNotFound(format!(
            "old_str not found in {}",
            resolved.display()
        )));
    }
    if count > 1 && !replace_all {
        return Err(ToolError::StrReplaceAmbiguous(format!(
            "old_str appears {count} times in {}; pass replace_all to replace every occurrence",
            resolved.display()
        )));
    }

    let (updated, first_offset) = replace_occurrences(&content, old, new, replace_all);
    let replaced = if replace_all { count } else { 1 };

    let permissions = meta.permissions();
    fs::write(&resolved, &updated)
        .map_err(|e| ToolError::Io(format!("cannot write {}: {e}", resolved.display())))?;
    fs::set_permissions(&resolved, permissions)
        .map_err(|e| ToolError::Io(format!("cannot restore mode on {}: {e}", resolved.display())))?;

    let snippet = snippet_around(&updated, first_offset, new.len());
    Ok(format!(
        "Replaced {replaced} occurrence{} of old_str in {}\n\n{snippet}",
        if replaced == 1 { "" } else { "s" },
        resolved.display()
    ))
}

/// Non-overlapping occurrence count.
fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            count += 1;
            i += needle.len();
        } else {
            i += 1;
        }
    }
    count
}

/// Replace the first (or every) occurrence, returning the new content and
/// the byte offset of the first replacement in it.
fn replace_occurrences(
    haystack: &[u8],
    needle: &[u8],
    replacement: &[u8],
    all: bool,
) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(haystack.len());
    let mut first_offset = 0;
    let mut replaced_any = false;
    let mut i = 0;
    while i < haystack.len() {
        let matches = i + needle.len() <= haystack.len()
            && &haystack[i..i + needle.len()] == needle
            && (all || !replaced_any);
        if matches {
            if !replaced_any {
                first_offset = out.len();
                replaced_any = true;
            }
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    (out, first_offset)
}

/// Numbered lines around the replaced region.
fn snippet_around(content: &[u8], offset: usize, replacement_len: usize) -> String {
    let text = String::from_utf8_lossy(content);
    let first_line = 1 + bytecount_newlines(&content[..offset.min(content.len())]);
    let end = (offset + replacement_len).min(content.len());
    let last_line = 1 + bytecount_newlines(&content[..end]);

    let from = first_line.saturating_sub(SNIPPET_CONTEXT_LINES).max(1);
    let to = last_line + SNIPPET_CONTEXT_LINES;

    let mut out = String::new();
    for (idx, line) in text.lines().enumerate() {
        let lineno = idx as u64 + 1;
        if lineno < from {
            continue;
        }
        if lineno > to {
            break;
        }
        push_numbered_line(&mut out, lineno, line);
    }
    out
}

fn bytecount_newlines(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|&&b| b == b'\n').count() as u64
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use crate::config::ServerConfig;
    use crate::tools::test_support::config_for;
    use crate::tools::view;

    use super::*;

    fn setup(content: &str) -> (TempDir, ServerConfig, Session, PathBuf) {
        let dir = TempDir::new().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let config = config_for(&base);
        let session = Session::new(base.clone());
        let file = base.join("file.txt");
        std::fs::write(&file, content).unwrap();
        // Satisfy the view-before-edit gate the way a client would.
        view::view(&config, &session, "file.txt", None).unwrap();
        (dir, config, session, file)
    }

    #[test]
    fn unique_replacement_succeeds_with_snippet() {
        let (_dir, config, session, file) = setup("one\ntwo\nthree\n");
        let message =
            str_replace(&config, &session, "file.txt", "two", Some("TWO"), false).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "one\nTWO\nthree\n");
        assert!(message.contains("Replaced 1 occurrence"));
        assert!(message.contains("     2\tTWO"));
    }

    #[test]
    fn missing_old_str_is_not_found() {
        let (_dir, config, session, _file) = setup("one\n");
        let err =
            str_replace(&config, &session, "file.txt", "absent", None, false).unwrap_err();
        assert_eq!(err.code(), "STR_REPLACE_NOT_FOUND");
    }

    #[test]
    fn ambiguous_replacement_reports_the_count() {
        let (_dir, config, session, file) = setup("foo bar foo baz foo\n");
        let err =
            str_replace(&config, &session, "file.txt", "foo", Some("qux"), false).unwrap_err();
        assert_eq!(err.code(), "STR_REPLACE_AMBIGUOUS");
        assert!(err.to_string().contains('3'));
        assert!(err.to_string().contains("replace_all"));
        // Nothing was written.
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "foo bar foo baz foo\n"
        );
    }

    #[test]
    fn replace_all_rewrites_every_occurrence() {
        let (_dir, config, session, file) = setup("foo bar foo baz foo\n");
        let message =
            str_replace(&config, &session, "file.txt", "foo", Some("qux"), true).unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "qux bar qux baz qux\n"
        );
        assert!(message.contains("Replaced 3 occurrences"));
    }

    #[test]
    fn omitted_new_str_deletes_the_match() {
        let (_dir, config, session, file) = setup("keep DELETE keep\n");
        str_replace(&config, &session, "file.txt", "DELETE ", None, false).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "keep keep\n");
    }

    #[test]
    fn unviewed_file_is_gated() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let config = config_for(&base);
        let session = Session::new(base.clone());
        std::fs::write(base.join("file.txt"), "content").unwrap();

        let err =
            str_replace(&config, &session, "file.txt", "content", Some("x"), false).unwrap_err();
        assert_eq!(err.code(), "FILE_NOT_VIEWED");
    }

    #[test]
    fn gate_is_skipped_when_policy_is_off() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let mut config = config_for(&base);
        config.require_view_before_edit = false;
        let session = Session::new(base.clone());
        std::fs::write(base.join("file.txt"), "content").unwrap();

        str_replace(&config, &session, "file.txt", "content", Some("x"), false).unwrap();
        assert_eq!(
            std::fs::read_to_string(base.join("file.txt")).unwrap(),
            "x"
        );
    }

    #[cfg(unix)]
    #[test]
    fn mode_bits_are_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, config, session, file) = setup("#!/bin/sh\necho run\n");
        let mut permissions = std::fs::metadata(&file).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&file, permissions).unwrap();

        str_replace(&config, &session, "file.txt", "run", Some("ran"), false).unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn missing_file_is_path_not_found() {
        let (_dir, config, session, _file) = setup("x\n");
        let err = str_replace(&config, &session, "ghost.txt", "a", None, false).unwrap_err();
        assert_eq!(err.code(), "PATH_NOT_FOUND");
    }

    #[test]
    fn empty_old_str_is_invalid() {
        let (_dir, config, session, _file) = setup("x\n");
        let err = str_replace(&config, &session, "file.txt", "", None, false).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn count_and_replace_helpers() {
        assert_eq!(count_occurrences(b"aaaa", b"aa"), 2);
        assert_eq!(count_occurrences(b"abc", b"d"), 0);
        let (out, offset) = replace_occurrences(b"x foo y", b"foo", b"longer", false);
        assert_eq!(out, b"x longer y");
        assert_eq!(offset, 2);
    }
}
