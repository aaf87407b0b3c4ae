use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::path_resolver::PathResolver;

/// Transport selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Stdio,
}

/// Every tool name the server knows how to register. `--disable-tool`
/// arguments are validated against this list.
pub const BASE_TOOLS: &[&str] = &[
    "bash",
    "task_output",
    "view",
    "str_replace",
    "create_file",
    "grep",
    "glob",
];

/// Process-wide immutable configuration, shared by reference between all
/// sessions. Mutable per-connection state lives in [`crate::Session`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub port: u16,
    /// Initial working directory for every new session; absolute.
    pub workdir: PathBuf,
    /// Shell used for every command; probed once at startup.
    pub shell: PathBuf,
    pub resolver: Arc<PathResolver>,
    /// Largest file `view` will read or `create_file` will write, in bytes.
    pub max_file_size: u64,
    /// Foreground command timeout applied when the caller passes none.
    pub default_timeout_ms: u64,
    /// Safety net for background tasks; `None` disables it.
    pub background_task_timeout: Option<Duration>,
    pub compat_mode: bool,
    pub disabled_tools: HashSet<String>,
    pub require_view_before_edit: bool,
    pub bearer_token: Option<String>,
    /// Static context string handed to clients at initialize time.
    pub instructions: String,
}

/// Probe for bash, falling back to the POSIX shell. Called once at startup;
/// the result is fixed for the lifetime of the process.
pub fn detect_shell() -> PathBuf {
    let bash = Path::new("/bin/bash");
    let shell = if bash.exists() {
        bash
    } else {
        Path::new("/bin/sh")
    };
    tracing::info!("using shell {}", shell.display());
    shell.to_path_buf()
}
