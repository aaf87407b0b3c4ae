use std::sync::Arc;

use rmcp::ErrorData as McpError;
use rmcp::ServerHandler;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use rmcp::model::Content;
use rmcp::model::Implementation;
use rmcp::model::ProgressNotificationParam;
use rmcp::model::ProtocolVersion;
use rmcp::model::ServerCapabilities;
use rmcp::model::ServerInfo;
use rmcp::service::RequestContext;
use rmcp::service::RoleServer;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use boris_core::ServerConfig;
use boris_core::Session;
use boris_core::SessionRegistry;
use boris_core::ToolError;
use boris_core::exec;
use boris_core::exec::ExecOutcome;
use boris_core::exec::ExecParams;
use boris_core::exec::KillReason;
use boris_core::exec::OutputChunk;
use boris_core::exec::TaskReport;
use boris_core::exec::TaskStatus;
use boris_core::tools;
use boris_core::tools::ViewResult;

/// One protocol server per transport session. The handler owns the session's
/// mutable state; immutable configuration is shared by reference. Tool
/// handlers are bound at construction, which is why the transport layer
/// builds a fresh instance per session instead of swapping sessions per
/// request.
pub struct BorisServer {
    config: Arc<ServerConfig>,
    session: Arc<Session>,
    registry: Option<Arc<SessionRegistry>>,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BashParams {
    /// Shell command to execute in the session's working directory.
    pub command: String,
    /// Timeout in milliseconds; clamped to 600000 (10 minutes).
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Start the command as a background task and return its id immediately.
    #[serde(default)]
    pub run_in_background: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TaskOutputParams {
    /// Id returned by a bash call with run_in_background.
    pub task_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ViewParams {
    /// File or directory to show.
    pub path: String,
    /// Two-element [start, end] line range, 1-indexed and inclusive.
    #[serde(default)]
    pub view_range: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StrReplaceParams {
    /// File to edit.
    pub path: String,
    /// Exact text to replace; must be unique unless replace_all is set.
    pub old_str: String,
    /// Replacement text; omitting it deletes old_str.
    #[serde(default)]
    pub new_str: Option<String>,
    /// Replace every occurrence instead of requiring uniqueness.
    #[serde(default)]
    pub replace_all: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateFileParams {
    /// File to create or overwrite.
    pub path: String,
    /// Full file content.
    pub content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GrepParams {
    /// Regular expression to search for.
    pub pattern: String,
    /// File or directory to search; defaults to the working directory.
    #[serde(default)]
    pub path: Option<String>,
    /// content (default), files_with_matches, or count.
    #[serde(default)]
    pub output_mode: Option<String>,
    /// Case-insensitive matching.
    #[serde(default)]
    pub case_insensitive: Option<bool>,
    /// Include line numbers in content output. Defaults to true.
    #[serde(default)]
    pub line_numbers: Option<bool>,
    /// Stop after this many results.
    #[serde(default)]
    pub max_results: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GlobParams {
    /// Doublestar glob pattern, e.g. `**/*.rs`.
    pub pattern: String,
    /// Directory to search; defaults to the working directory.
    #[serde(default)]
    pub path: Option<String>,
    /// Restrict matches to `file` or `directory`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EditorParams {
    /// Sub-command: view, str_replace, or create.
    pub command: String,
    /// File or directory the sub-command operates on.
    pub path: String,
    /// view: two-element [start, end] line range.
    #[serde(default)]
    pub view_range: Option<Vec<i64>>,
    /// str_replace: exact text to replace.
    #[serde(default)]
    pub old_str: Option<String>,
    /// str_replace: replacement text.
    #[serde(default)]
    pub new_str: Option<String>,
    /// str_replace: replace every occurrence.
    #[serde(default)]
    pub replace_all: Option<bool>,
    /// create: full file content.
    #[serde(default)]
    pub file_text: Option<String>,
}

#[tool_router(router = router_bash)]
impl BorisServer {
    #[tool(
        name = "bash",
        description = "Run a shell command. cd persists across calls; pass run_in_background for long-running commands and collect them with task_output."
    )]
    async fn bash(
        &self,
        Parameters(params): Parameters<BashParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.session.touch();

        if params.run_in_background.unwrap_or(false) {
            self.register_for_cleanup(&context);
            return Ok(
                match exec::run_background(&self.config, &self.session, &params.command).await {
                    Ok(task_id) => CallToolResult::success(vec![Content::text(format!(
                        "started background task {task_id}"
                    ))]),
                    Err(e) => tool_error(e),
                },
            );
        }

        let stream = spawn_progress_forwarder(&context);
        let outcome = exec::run_foreground(
            &self.config,
            &self.session,
            ExecParams {
                command: params.command,
                timeout_ms: params.timeout,
            },
            stream,
            context.ct.clone(),
        )
        .await;

        Ok(match outcome {
            Ok(outcome) => {
                CallToolResult::success(vec![Content::text(format_exec_outcome(&outcome))])
            }
            Err(e) => tool_error(e),
        })
    }
}

#[tool_router(router = router_task_output)]
impl BorisServer {
    #[tool(
        name = "task_output",
        description = "Fetch the output of a background task. A completed task is removed after the first read."
    )]
    async fn task_output(
        &self,
        Parameters(params): Parameters<TaskOutputParams>,
    ) -> Result<CallToolResult, McpError> {
        self.session.touch();
        Ok(match exec::task_output(&self.session, &params.task_id) {
            Ok(report) => CallToolResult::success(vec![Content::text(format_task_report(&report))]),
            Err(e) => tool_error(e),
        })
    }
}

#[tool_router(router = router_view)]
impl BorisServer {
    #[tool(
        name = "view",
        description = "Show a file with line numbers, an image, or a two-level directory listing. Files must be viewed before they can be edited."
    )]
    async fn view(
        &self,
        Parameters(params): Parameters<ViewParams>,
    ) -> Result<CallToolResult, McpError> {
        self.session.touch();
        Ok(self.view_impl(params))
    }
}

#[tool_router(router = router_str_replace)]
impl BorisServer {
    #[tool(
        name = "str_replace",
        description = "Replace an exact string in a file. old_str must match exactly once unless replace_all is set."
    )]
    async fn str_replace(
        &self,
        Parameters(params): Parameters<StrReplaceParams>,
    ) -> Result<CallToolResult, McpError> {
        self.session.touch();
        Ok(self.str_replace_impl(
            &params.path,
            &params.old_str,
            params.new_str.as_deref(),
            params.replace_all.unwrap_or(false),
        ))
    }
}

#[tool_router(router = router_create_file)]
impl BorisServer {
    #[tool(
        name = "create_file",
        description = "Create or overwrite a file, creating parent directories as needed."
    )]
    async fn create_file(
        &self,
        Parameters(params): Parameters<CreateFileParams>,
    ) -> Result<CallToolResult, McpError> {
        self.session.touch();
        Ok(self.create_file_impl(&params.path, &params.content))
    }
}

#[tool_router(router = router_grep)]
impl BorisServer {
    #[tool(
        name = "grep",
        description = "Regex content search. Respects .gitignore; output_mode selects matching lines, file paths, or per-file counts."
    )]
    async fn grep(
        &self,
        Parameters(params): Parameters<GrepParams>,
    ) -> Result<CallToolResult, McpError> {
        self.session.touch();
        let config = self.config.clone();
        let session = self.session.clone();
        let core_params = tools::GrepParams {
            pattern: params.pattern,
            path: params.path,
            output_mode: params.output_mode,
            case_insensitive: params.case_insensitive.unwrap_or(false),
            line_numbers: params.line_numbers.unwrap_or(true),
            max_results: params.max_results,
        };
        let result =
            tokio::task::spawn_blocking(move || tools::grep(&config, &session, core_params))
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(match result {
            Ok(text) => CallToolResult::success(vec![Content::text(text)]),
            Err(e) => tool_error(e),
        })
    }
}

#[tool_router(router = router_glob)]
impl BorisServer {
    #[tool(
        name = "glob",
        description = "Find paths matching a doublestar glob pattern, newest first. Respects .gitignore."
    )]
    async fn glob(
        &self,
        Parameters(params): Parameters<GlobParams>,
    ) -> Result<CallToolResult, McpError> {
        self.session.touch();
        let config = self.config.clone();
        let session = self.session.clone();
        let core_params = tools::GlobParams {
            pattern: params.pattern,
            path: params.path,
            kind: params.kind,
        };
        let result =
            tokio::task::spawn_blocking(move || tools::glob(&config, &session, core_params))
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(match result {
            Ok(text) => CallToolResult::success(vec![Content::text(text)]),
            Err(e) => tool_error(e),
        })
    }
}

#[tool_router(router = router_editor)]
impl BorisServer {
    #[tool(
        name = "str_replace_editor",
        description = "Combined file editor dispatched on command: view, str_replace, or create."
    )]
    async fn str_replace_editor(
        &self,
        Parameters(params): Parameters<EditorParams>,
    ) -> Result<CallToolResult, McpError> {
        self.session.touch();
        Ok(match params.command.as_str() {
            "view" => self.view_impl(ViewParams {
                path: params.path,
                view_range: params.view_range,
            }),
            "str_replace" => match params.old_str {
                Some(old_str) => self.str_replace_impl(
                    &params.path,
                    &old_str,
                    params.new_str.as_deref(),
                    params.replace_all.unwrap_or(false),
                ),
                None => tool_error(ToolError::InvalidInput(
                    "old_str is required for str_replace".to_string(),
                )),
            },
            "create" => match params.file_text {
                Some(file_text) => self.create_file_impl(&params.path, &file_text),
                None => tool_error(ToolError::InvalidInput(
                    "file_text is required for create".to_string(),
                )),
            },
            other => tool_error(ToolError::InvalidInput(format!(
                "unknown command {other:?}; expected view, str_replace, or create"
            ))),
        })
    }
}

impl BorisServer {
    pub fn new(config: Arc<ServerConfig>, registry: Option<Arc<SessionRegistry>>) -> Self {
        let session = Arc::new(Session::new(config.workdir.clone()));
        debug!(nonce = session.nonce(), "new session");
        Self {
            tool_router: Self::build_router(&config),
            config,
            session,
            registry,
        }
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    /// Register the enabled tool set for one session. Disabling `bash` also
    /// omits `task_output`; compat mode collapses the three file tools into
    /// `str_replace_editor`, which any of their disable entries suppresses.
    fn build_router(config: &ServerConfig) -> ToolRouter<Self> {
        let disabled = |name: &str| config.disabled_tools.contains(name);
        let mut router = ToolRouter::default();
        if !disabled("bash") {
            router = router + Self::router_bash();
            if !disabled("task_output") {
                router = router + Self::router_task_output();
            }
        }
        if config.compat_mode {
            if !disabled("view") && !disabled("str_replace") && !disabled("create_file") {
                router = router + Self::router_editor();
            }
        } else {
            if !disabled("view") {
                router = router + Self::router_view();
            }
            if !disabled("str_replace") {
                router = router + Self::router_str_replace();
            }
            if !disabled("create_file") {
                router = router + Self::router_create_file();
            }
        }
        if !disabled("grep") {
            router = router + Self::router_grep();
        }
        if !disabled("glob") {
            router = router + Self::router_glob();
        }
        router
    }

    /// Lazy once-per-session registry insertion, keyed by the transport
    /// session id. Only the bash handler creates long-lived resources, so
    /// this is the only place a session needs to become reachable for
    /// transport-driven cleanup.
    fn register_for_cleanup(&self, context: &RequestContext<RoleServer>) {
        let Some(registry) = &self.registry else {
            return;
        };
        let Some(id) = transport_session_id(context) else {
            return;
        };
        if self.session.mark_registered() {
            registry.register(&id, self.session.clone());
            debug!(session_id = %id, "session registered for background-task cleanup");
        }
    }

    fn view_impl(&self, params: ViewParams) -> CallToolResult {
        let range = match params.view_range {
            None => None,
            Some(range) if range.len() == 2 => Some([range[0], range[1]]),
            Some(range) => {
                return tool_error(ToolError::InvalidInput(format!(
                    "view_range must have exactly 2 elements, got {}",
                    range.len()
                )));
            }
        };
        match tools::view(&self.config, &self.session, &params.path, range) {
            Ok(ViewResult::Text(text)) => CallToolResult::success(vec![Content::text(text)]),
            Ok(ViewResult::Image { media_type, data }) => {
                CallToolResult::success(vec![Content::image(data, media_type)])
            }
            Err(e) => tool_error(e),
        }
    }

    fn str_replace_impl(
        &self,
        path: &str,
        old_str: &str,
        new_str: Option<&str>,
        replace_all: bool,
    ) -> CallToolResult {
        match tools::str_replace(&self.config, &self.session, path, old_str, new_str, replace_all)
        {
            Ok(message) => CallToolResult::success(vec![Content::text(message)]),
            Err(e) => tool_error(e),
        }
    }

    fn create_file_impl(&self, path: &str, content: &str) -> CallToolResult {
        match tools::create_file(&self.config, &self.session, path, content) {
            Ok(message) => CallToolResult::success(vec![Content::text(message)]),
            Err(e) => tool_error(e),
        }
    }
}

#[tool_handler]
impl ServerHandler for BorisServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(self.config.instructions.clone()),
        }
    }
}

fn tool_error(err: ToolError) -> CallToolResult {
    CallToolResult::error(vec![Content::text(err.to_string())])
}

/// The streamable HTTP layer stashes the request parts in the context
/// extensions; the session id header identifies the transport session.
fn transport_session_id(context: &RequestContext<RoleServer>) -> Option<String> {
    let parts = context.extensions.get::<axum::http::request::Parts>()?;
    parts
        .headers
        .get("mcp-session-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Forward incremental exec output as progress notifications on the current
/// request. Returns `None` when the client did not send a progress token;
/// the final result carries the complete output either way.
fn spawn_progress_forwarder(
    context: &RequestContext<RoleServer>,
) -> Option<mpsc::UnboundedSender<OutputChunk>> {
    let token = context.meta.get_progress_token()?;
    let peer = context.peer.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
    tokio::spawn(async move {
        let mut sequence = 0u64;
        while let Some(chunk) = rx.recv().await {
            sequence += 1;
            let message = match chunk {
                OutputChunk::Stdout(text) => text,
                OutputChunk::Stderr(text) => text,
            };
            let notification = ProgressNotificationParam {
                progress_token: token.clone(),
                progress: sequence as f64,
                total: None,
                message: Some(message),
            };
            if peer.notify_progress(notification).await.is_err() {
                break;
            }
        }
    });
    Some(tx)
}

fn format_exec_outcome(outcome: &ExecOutcome) -> String {
    let mut out = String::new();
    match outcome.killed {
        Some(KillReason::Timeout(ms)) => {
            out.push_str(&format!("command killed by timeout after {ms}ms\n"));
        }
        Some(KillReason::Cancelled) => out.push_str("command cancelled\n"),
        None => {}
    }
    out.push_str(&format!("exit_code: {}\n", outcome.exit_code));
    out.push_str("stdout:\n");
    out.push_str(&outcome.stdout);
    if !outcome.stdout.ends_with('\n') && !outcome.stdout.is_empty() {
        out.push('\n');
    }
    if !outcome.stderr.is_empty() {
        out.push_str("stderr:\n");
        out.push_str(&outcome.stderr);
        if !outcome.stderr.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn format_task_report(report: &TaskReport) -> String {
    let mut out = format!(
        "task {} status: {}\n",
        report.task_id,
        match report.status {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
        }
    );
    if let Some(code) = report.exit_code {
        out.push_str(&format!("exit_code: {code}\n"));
    }
    if report.timed_out {
        out.push_str("killed by the background task safety net\n");
    }
    out.push_str("stdout:\n");
    out.push_str(&report.stdout);
    if !report.stdout.ends_with('\n') && !report.stdout.is_empty() {
        out.push('\n');
    }
    if !report.stderr.is_empty() {
        out.push_str("stderr:\n");
        out.push_str(&report.stderr);
        if !report.stderr.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
