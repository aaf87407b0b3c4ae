use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use clap::Parser;
use clap::ValueEnum;
use rand::RngCore;

use boris_core::ServerConfig;
use boris_core::config::BASE_TOOLS;
use boris_core::config::TransportKind;
use boris_core::config::detect_shell;
use boris_core::instructions::build_instructions;
use boris_core::path_resolver::PathResolver;

/// Boris MCP server
///
/// Exposes shell execution, file editing and search tools over the Model
/// Context Protocol, on streamable HTTP or stdio.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Port for the HTTP transport.
    #[arg(long, default_value_t = 8132)]
    port: u16,

    /// Transport to serve on.
    #[arg(long, value_enum, default_value_t = TransportArg::Http)]
    transport: TransportArg,

    /// Initial working directory for new sessions; defaults to the server's.
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Default foreground command timeout in seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Directory the tools may touch; repeatable. No flags means no allow-list.
    #[arg(long = "allow-dir")]
    allow_dirs: Vec<PathBuf>,

    /// Doublestar pattern denied to every tool; repeatable.
    #[arg(long = "deny-pattern")]
    deny_patterns: Vec<String>,

    /// Require `Authorization: Bearer <token>` on /mcp.
    #[arg(long, conflicts_with = "generate_token")]
    token: Option<String>,

    /// Generate a random bearer token and print it to stderr.
    #[arg(long)]
    generate_token: bool,

    /// Tool name to leave unregistered; repeatable.
    #[arg(long = "disable-tool")]
    disable_tools: Vec<String>,

    /// Kill background tasks after this many seconds; 0 disables the safety net.
    #[arg(long, default_value_t = 600)]
    background_task_timeout: u64,

    /// Largest file view will read or create_file will write, in bytes.
    #[arg(long, default_value_t = 10_000_000)]
    max_file_size: u64,

    /// Require files to be viewed before str_replace or overwrite.
    #[arg(long, value_enum, default_value_t = ViewBeforeEditArg::Auto)]
    require_view_before_edit: ViewBeforeEditArg,

    /// Expose one str_replace_editor tool instead of view/str_replace/create_file.
    #[arg(long, default_value_t = false)]
    compat_mode: bool,

    /// Log level filter, e.g. `info` or `boris_core=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text)]
    log_format: LogFormatArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    Http,
    Stdio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ViewBeforeEditArg {
    Auto,
    True,
    False,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    let config = build_config(cli)?;
    boris_mcp_server::run_main(config).await
}

/// Diagnostics always go to stderr; in stdio mode stdout belongs to the
/// protocol.
fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormatArg::Text => builder.init(),
        LogFormatArg::Json => builder.json().init(),
    }
}

fn build_config(cli: Cli) -> anyhow::Result<ServerConfig> {
    let workdir = match cli.workdir {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let workdir = workdir
        .canonicalize()
        .with_context(|| format!("workdir {} cannot be resolved", workdir.display()))?;

    for tool in &cli.disable_tools {
        if !BASE_TOOLS.contains(&tool.as_str()) {
            bail!(
                "unknown tool {tool:?} in --disable-tool; expected one of: {}",
                BASE_TOOLS.join(", ")
            );
        }
    }

    let resolver = Arc::new(PathResolver::new(cli.allow_dirs, cli.deny_patterns)?);

    let bearer_token = if cli.generate_token {
        let token = generate_token();
        eprintln!("bearer token: {token}");
        Some(token)
    } else {
        cli.token
    };

    let instructions = build_instructions(&workdir, &resolver);

    Ok(ServerConfig {
        transport: match cli.transport {
            TransportArg::Http => TransportKind::Http,
            TransportArg::Stdio => TransportKind::Stdio,
        },
        port: cli.port,
        shell: detect_shell(),
        resolver,
        max_file_size: cli.max_file_size,
        default_timeout_ms: cli.timeout.saturating_mul(1000),
        background_task_timeout: (cli.background_task_timeout > 0)
            .then(|| Duration::from_secs(cli.background_task_timeout)),
        compat_mode: cli.compat_mode,
        disabled_tools: cli.disable_tools.into_iter().collect(),
        require_view_before_edit: cli.require_view_before_edit != ViewBeforeEditArg::False,
        bearer_token,
        instructions,
        workdir,
    })
}

/// 32 random bytes, hex encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
