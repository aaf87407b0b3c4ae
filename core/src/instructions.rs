use std::path::Path;

use crate::path_resolver::PathResolver;

/// Assemble the static context string handed to clients at initialize time:
/// the working directory, plus the allow/deny policy when one is configured.
pub fn build_instructions(workdir: &Path, resolver: &PathResolver) -> String {
    let mut out = format!("Working directory: {}", workdir.display());
    if !resolver.allow_dirs().is_empty() {
        let dirs = resolver
            .allow_dirs()
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("\nAllowed directories: {dirs}"));
    }
    if !resolver.deny_patterns().is_empty() {
        out.push_str(&format!(
            "\nDenied patterns: {}",
            resolver.deny_patterns().join(", ")
        ));
    }
    out
}
