use thiserror::Error;

/// Errors raised inside the agent core.
///
/// None of these escape a command cycle: `Brain::handle_command` turns every
/// one of them into an operator-facing message.
#[derive(Debug, Error)]
pub enum Error {
    /// The inference, embedding or vision backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend timed out after {0}ms")]
    Timeout(u64),

    /// The backend answered, but not in the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("tool '{tool}' is missing required argument '{argument}'")]
    MissingArgument {
        tool: &'static str,
        argument: &'static str,
    },

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("browser not connected")]
    BrowserUnavailable,

    #[error("browser error: {0}")]
    Browser(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
