use std::fs;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::error::ToolError;
use crate::session::Session;
use crate::tools::push_numbered_line;

/// Characters kept per line before the gutter truncation marker kicks in.
const MAX_LINE_CHARS: usize = 2000;

/// Bytes sniffed to classify a file as text, binary, or image.
const SNIFF_LEN: usize = 512;

/// Directory names excluded from directory listings. Everything else,
/// dotfiles included, is shown.
const LISTING_EXCLUDES: &[&str] = &[".git", "node_modules"];

#[derive(Debug)]
pub enum ViewResult {
    Text(String),
    Image { media_type: String, data: String },
}

/// Show a file or directory.
///
/// Directories get a two-level listing. Files are sniffed: known image
/// formats come back as base64 image content, files with NUL bytes as a
/// binary notice, and everything else as numbered text. A successful text
/// read marks the canonical path as viewed in the session.
pub fn view(
    config: &ServerConfig,
    session: &Session,
    path: &str,
    view_range: Option<[i64; 2]>,
) -> Result<ViewResult> {
    let resolved = config.resolver.resolve(&session.cwd(), path)?;
    let meta = fs::metadata(&resolved).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            ToolError::PathNotFound(format!("{} does not exist", resolved.display()))
        }
        _ => ToolError::Io(format!("cannot stat {}: {e}", resolved.display())),
    })?;

    if meta.is_dir() {
        if view_range.is_some() {
            return Err(ToolError::InvalidInput(
                "view_range is not supported for directories".to_string(),
            ));
        }
        return Ok(ViewResult::Text(list_directory(&resolved)?));
    }

    if meta.len() > config.max_file_size {
        return Err(ToolError::FileTooLarge(format!(
            "{} is {} bytes, which exceeds the {} byte limit",
            resolved.display(),
            meta.len(),
            config.max_file_size
        )));
    }

    let head = sniff(&resolved)?;
    if let Some(media_type) = image_media_type(&head, &resolved) {
        let bytes =
            fs::read(&resolved).map_err(|e| ToolError::Io(format!("cannot read {}: {e}", resolved.display())))?;
        return Ok(ViewResult::Image {
            media_type,
            data: BASE64.encode(bytes),
        });
    }
    if head.contains(&0) {
        return Ok(ViewResult::Text(format!(
            "{} is a binary file ({} bytes)",
            resolved.display(),
            meta.len()
        )));
    }

    let text = read_numbered(&resolved, view_range)?;
    session.mark_viewed(resolved);
    Ok(ViewResult::Text(text))
}

fn sniff(path: &Path) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)
        .map_err(|e| ToolError::Io(format!("cannot open {}: {e}", path.display())))?;
    let mut head = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    loop {
        let n = file
            .read(&mut head[filled..])
            .map_err(|e| ToolError::Io(format!("cannot read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == head.len() {
            break;
        }
    }
    head.truncate(filled);
    Ok(head)
}

/// Magic-number image detection, plus SVG by extension. The BMP signature is
/// only two printable bytes, so it additionally requires a NUL in the header
/// to avoid claiming text files that happen to start with "BM".
fn image_media_type(head: &[u8], path: &Path) -> Option<String> {
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png".to_string());
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg".to_string());
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Some("image/gif".to_string());
    }
    if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        return Some("image/webp".to_string());
    }
    if head.starts_with(b"BM") && head.contains(&0) {
        return Some("image/bmp".to_string());
    }
    if path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("svg"))
    {
        return Some(
            mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        );
    }
    None
}

/// Two-level listing: the directory's entries and, for each subdirectory,
/// its immediate children. Symlinks are annotated, not followed.
fn list_directory(root: &Path) -> Result<String> {
    let mut out = format!("{}\n", root.display());
    let entries = sorted_entries(root)
        .map_err(|e| ToolError::Io(format!("cannot list {}: {e}", root.display())))?;
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if LISTING_EXCLUDES.contains(&name.as_str()) {
            continue;
        }
        push_listing_line(&mut out, &entry, &name, 1)?;
        let file_type = entry
            .file_type()
            .map_err(|e| ToolError::Io(e.to_string()))?;
        if file_type.is_dir() {
            // Second level; unreadable subdirectories are skipped.
            let Ok(children) = sorted_entries(&entry.path()) else {
                continue;
            };
            for child in children {
                let child_name = child.file_name().to_string_lossy().into_owned();
                if LISTING_EXCLUDES.contains(&child_name.as_str()) {
                    continue;
                }
                push_listing_line(&mut out, &child, &child_name, 2)?;
            }
        }
    }
    Ok(out)
}

fn sorted_entries(dir: &Path) -> std::io::Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

fn push_listing_line(out: &mut String, entry: &fs::DirEntry, name: &str, depth: usize) -> Result<()> {
    let file_type = entry
        .file_type()
        .map_err(|e| ToolError::Io(e.to_string()))?;
    let indent = "  ".repeat(depth);
    if file_type.is_symlink() {
        let target = fs::read_link(entry.path())
            .map(|t| t.display().to_string())
            .unwrap_or_else(|_| "?".to_string());
        out.push_str(&format!("{indent}{name} -> {target}\n"));
    } else if file_type.is_dir() {
        out.push_str(&format!("{indent}{name}/\n"));
    } else {
        out.push_str(&format!("{indent}{name}\n"));
    }
    Ok(())
}

/// Stream the file line by line rather than buffering it whole, numbering
/// each line and truncating pathological ones.
fn read_numbered(path: &Path, view_range: Option<[i64; 2]>) -> Result<String> {
    let (start, end) = match view_range {
        Some([start, end]) => {
            if start < 1 {
                return Err(ToolError::InvalidInput(format!(
                    "view_range start must be at least 1, got {start}"
                )));
            }
            if end < start {
                return Err(ToolError::InvalidInput(format!(
                    "view_range end {end} is before start {start}"
                )));
            }
            (start as u64, Some(end as u64))
        }
        None => (1, None),
    };

    let file = fs::File::open(path)
        .map_err(|e| ToolError::Io(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut out = String::new();
    let mut lineno = 0u64;
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let n = reader
            .read_until(b'\n', &mut raw)
            .map_err(|e| ToolError::Io(format!("cannot read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        lineno += 1;
        if lineno < start {
            continue;
        }
        // An end past the last line clamps silently.
        if let Some(end) = end
            && lineno > end
        {
            lineno -= 1;
            break;
        }
        let trimmed = raw.strip_suffix(b"\n").unwrap_or(&raw);
        let line = String::from_utf8_lossy(trimmed);
        let total_chars = line.chars().count();
        if total_chars > MAX_LINE_CHARS {
            let kept: String = line.chars().take(MAX_LINE_CHARS).collect();
            push_numbered_line(
                &mut out,
                lineno,
                &format!("{kept}… [truncated, {total_chars} chars total]"),
            );
        } else {
            push_numbered_line(&mut out, lineno, &line);
        }
    }

    if lineno < start && view_range.is_some() {
        return Err(ToolError::InvalidInput(format!(
            "view_range start {start} exceeds the file's {lineno} lines"
        )));
    }
    Ok(out)
}
