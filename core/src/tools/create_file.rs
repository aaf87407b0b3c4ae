use std::fs;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::OpenOptionsExt;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::error::ToolError;
use crate::session::Session;

/// Write a file, creating parent directories as needed.
///
/// Brand-new files are always allowed; overwriting an existing file is gated
/// on view-before-edit when that policy is enabled. Parents are created with
/// mode 0755 and new files with mode 0644; an overwritten file keeps its
/// existing mode.
pub fn create_file(
    config: &ServerConfig,
    session: &Session,
    path: &str,
    content: &str,
) -> Result<String> {
    if content.len() as u64 > config.max_file_size {
        return Err(ToolError::FileTooLarge(format!(
            "content is {} bytes, which exceeds the {} byte limit",
            content.len(),
            config.max_file_size
        )));
    }

    let resolved = config.resolver.resolve(&session.cwd(), path)?;
    let existing = match fs::metadata(&resolved) {
        Ok(meta) if meta.is_dir() => {
            return Err(ToolError::InvalidInput(format!(
                "{} is a directory",
                resolved.display()
            )));
        }
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(ToolError::Io(format!(
                "cannot stat {}: {e}",
                resolved.display()
            )));
        }
    };

    if existing.is_some() && config.require_view_before_edit && !session.has_viewed(&resolved) {
        return Err(ToolError::FileNotViewed(format!(
            "{} already exists; view it before overwriting",
            resolved.display()
        )));
    }

    if let Some(parent) = resolved.parent()
        && !parent.exists()
    {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .map_err(|e| ToolError::Io(format!("cannot create {}: {e}", parent.display())))?;
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&resolved)
        .map_err(|e| ToolError::Io(format!("cannot open {}: {e}", resolved.display())))?;
    file.write_all(content.as_bytes())
        .map_err(|e| ToolError::Io(format!("cannot write {}: {e}", resolved.display())))?;

    let verb = if existing.is_some() { "Overwrote" } else { "Created" };
    Ok(format!(
        "{verb} {} ({} bytes)",
        resolved.display(),
        content.len()
    ))
}
