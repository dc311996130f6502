use thiserror::Error;

/// Failure taxonomy of the deep search engine.
#[derive(Debug, Error)]
pub enum DelveError {
    #[error("{0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Session already has an active stream")]
    Conflict { active_stream_id: String },

    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("stream registration failed: {0}")]
    StreamRegistration(String),

    #[error("model invocation failed: {0}")]
    UpstreamModel(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl DelveError {
    pub fn status_code(&self) -> u16 {
        match self {
            DelveError::Validation(_) => 400,
            DelveError::Authorization(_) => 403,
            DelveError::NotFound(_) => 404,
            DelveError::Conflict { .. } => 409,
            DelveError::ToolExecution { .. } => 500,
            DelveError::StreamRegistration(_) => 500,
            DelveError::UpstreamModel(_) => 502,
            DelveError::Storage(_) => 500,
        }
    }

    /// Short machine-readable code used in observability records.
    pub fn code(&self) -> &'static str {
        match self {
            DelveError::Validation(_) => "validation",
            DelveError::Authorization(_) => "authorization",
            DelveError::NotFound(_) => "not_found",
            DelveError::Conflict { .. } => "conflict",
            DelveError::ToolExecution { .. } => "tool_execution",
            DelveError::StreamRegistration(_) => "stream_registration",
            DelveError::UpstreamModel(_) => "upstream_model",
            DelveError::Storage(_) => "storage",
        }
    }
}

pub type DelveResult<T> = Result<T, DelveError>;
