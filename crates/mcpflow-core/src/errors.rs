//! Error types for session setup and query processing
//!
//! Errors are grouped by where they surface. Configuration and connection
//! failures abort session setup and propagate to the caller. Gateway and tool
//! failures happen inside a query's turn loop and are folded into the answer
//! text instead of being raised, so a bad tool call never takes the session
//! down with it.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Connection to service '{service}' failed: {message}")]
    ConnectionError { service: String, message: String },
    #[error("LLM gateway error: {0}")]
    GatewayError(String),
    #[error("Tool execution failed for '{tool_name}': {message}")]
    ToolInvocationError { tool_name: String, message: String },
    #[error("Tool '{0}' not found")]
    ToolNotFound(String),
    #[error("Prompt template error: {0}")]
    TemplateError(String),
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl FlowError {
    pub fn connection(service: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::ConnectionError {
            service: service.into(),
            message: message.into(),
        }
    }

    /// The message without the variant prefix, for embedding in answer markers.
    pub fn detail(&self) -> String {
        match self {
            FlowError::ConnectionError { message, .. } | FlowError::ToolInvocationError { message, .. } => {
                message.clone()
            }
            FlowError::ConfigError(message)
            | FlowError::GatewayError(message)
            | FlowError::TemplateError(message)
            | FlowError::NotInitialized(message)
            | FlowError::IoError(message)
            | FlowError::InternalError(message) => message.clone(),
            FlowError::ToolNotFound(_) => self.to_string(),
        }
    }

    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::ToolInvocationError {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for FlowError {
    fn from(err: reqwest::Error) -> Self {
        FlowError::GatewayError(err.to_string())
    }
}
