//! Configuration management for MCP servers and workflows.
//!
//! Server and workflow documents are loaded from JSON or YAML files found in
//! the working directory or the user's config directories, validated
//! against each other, and combined with the model API key from the
//! environment.

pub mod loader;
pub mod types;

pub use loader::{ConfigFormat, ConfigLoader, ConfigPaths};
pub use types::{AppConfig, McpServerConfig, WorkflowSpec};
