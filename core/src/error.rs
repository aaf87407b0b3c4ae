use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

/// Operational tool failure. `Display` renders the wire format carried in
/// `isError` tool results: `[CODE] message`, where CODE is drawn from the
/// fixed catalog below.
///
/// Infrastructure failures (malformed requests, handler panics) are not
/// represented here; they surface as protocol-level errors in the transport
/// layer.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("[INVALID_INPUT] {0}")]
    InvalidInput(String),

    #[error("[PATH_NOT_FOUND] {0}")]
    PathNotFound(String),

    #[error("[ACCESS_DENIED] {0}")]
    AccessDenied(String),

    #[error("[FILE_TOO_LARGE] {0}")]
    FileTooLarge(String),

    #[error("[IO_ERROR] {0}")]
    Io(String),

    #[error("[FILE_NOT_VIEWED] {0}")]
    FileNotViewed(String),

    #[error("[SESSION_CLOSED] {0}")]
    SessionClosed(String),

    #[error("[BASH_EMPTY_COMMAND] {0}")]
    BashEmptyCommand(String),

    #[error("[BASH_START_FAILED] {0}")]
    BashStartFailed(String),

    #[error("[BASH_TASK_LIMIT] {0}")]
    BashTaskLimit(String),

    #[error("[BASH_TASK_NOT_FOUND] {0}")]
    BashTaskNotFound(String),

    #[error("[STR_REPLACE_NOT_FOUND] {0}")]
    StrReplaceNotFound(String),

    #[error("[STR_REPLACE_AMBIGUOUS] {0}")]
    StrReplaceAmbiguous(String),

    #[error("[GREP_INVALID_PATTERN] {0}")]
    GrepInvalidPattern(String),

    #[error("[GREP_INVALID_OUTPUT_MODE] {0}")]
    GrepInvalidOutputMode(String),

    #[error("[GLOB_INVALID_PATTERN] {0}")]
    GlobInvalidPattern(String),

    #[error("[GLOB_INVALID_TYPE] {0}")]
    GlobInvalidType(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::InvalidInput(_) => "INVALID_INPUT",
            ToolError::PathNotFound(_) => "PATH_NOT_FOUND",
            ToolError::AccessDenied(_) => "ACCESS_DENIED",
            ToolError::FileTooLarge(_) => "FILE_TOO_LARGE",
            ToolError::Io(_) => "IO_ERROR",
            ToolError::FileNotViewed(_) => "FILE_NOT_VIEWED",
            ToolError::SessionClosed(_) => "SESSION_CLOSED",
            ToolError::BashEmptyCommand(_) => "BASH_EMPTY_COMMAND",
            ToolError::BashStartFailed(_) => "BASH_START_FAILED",
            ToolError::BashTaskLimit(_) => "BASH_TASK_LIMIT",
            ToolError::BashTaskNotFound(_) => "BASH_TASK_NOT_FOUND",
            ToolError::StrReplaceNotFound(_) => "STR_REPLACE_NOT_FOUND",
            ToolError::StrReplaceAmbiguous(_) => "STR_REPLACE_AMBIGUOUS",
            ToolError::GrepInvalidPattern(_) => "GREP_INVALID_PATTERN",
            ToolError::GrepInvalidOutputMode(_) => "GREP_INVALID_OUTPUT_MODE",
            ToolError::GlobInvalidPattern(_) => "GLOB_INVALID_PATTERN",
            ToolError::GlobInvalidType(_) => "GLOB_INVALID_TYPE",
        }
    }
}

impl From<io::Error> for ToolError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => ToolError::PathNotFound(e.to_string()),
            _ => ToolError::Io(e.to_string()),
        }
    }
}
