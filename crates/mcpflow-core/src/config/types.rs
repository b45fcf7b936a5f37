//! Configuration type definitions
//!
//! Two documents describe a deployment: the MCP server list (keyed under
//! `mcpServers`) and the workflow list (keyed under `workflows`). Both are
//! plain maps keyed by name; insertion order is not significant, but the
//! order of `mcp_servers_used` inside a workflow is, because it decides which
//! server wins when two of them expose the same tool name.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::errors::FlowError;
use crate::prompt::validate_template;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(skip)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(rename = "transportType", default = "default_transport")]
    pub transport_type: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Seconds to wait for a single tool call.
    #[serde(default = "default_mcp_timeout")]
    pub timeout: u64,
    /// Tokens of text output kept before truncation.
    #[serde(default = "default_mcp_token_limit")]
    pub token_limit: u32,
}

impl McpServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
            transport_type: default_transport(),
            working_dir: None,
            timeout: default_mcp_timeout(),
            token_limit: default_mcp_token_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(rename = "llm_model")]
    pub model_name: String,
    #[serde(rename = "mcp_servers_used", default)]
    pub backend_services_used: Vec<String>,
    pub initial_prompt_template: String,
    #[serde(rename = "max_conversation_turns", default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default)]
    pub description: Option<String>,
}

impl WorkflowSpec {
    pub fn new(model_name: impl Into<String>, initial_prompt_template: impl Into<String>, max_turns: usize) -> Self {
        Self {
            model_name: model_name.into(),
            backend_services_used: Vec::new(),
            initial_prompt_template: initial_prompt_template.into(),
            max_turns,
            description: None,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), FlowError> {
        if self.model_name.trim().is_empty() {
            return Err(FlowError::ConfigError(format!(
                "Workflow '{}' has an empty 'llm_model'",
                name
            )));
        }
        if self.max_turns == 0 {
            return Err(FlowError::ConfigError(format!(
                "Workflow '{}' 'max_conversation_turns' must be greater than 0",
                name
            )));
        }
        validate_template(&self.initial_prompt_template).map_err(|e| {
            FlowError::ConfigError(format!("Workflow '{}' has an invalid prompt template: {}", name, e))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct McpServersDocument {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WorkflowsDocument {
    pub workflows: BTreeMap<String, WorkflowSpec>,
}

/// Everything needed to start a workflow session.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub gemini_base_url: String,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub workflows: BTreeMap<String, WorkflowSpec>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.api_key.trim().is_empty() {
            return Err(FlowError::ConfigError("API key cannot be empty".to_string()));
        }

        for (name, server) in &self.mcp_servers {
            if server.command.trim().is_empty() {
                return Err(FlowError::ConfigError(format!(
                    "Server '{}' has an empty 'command'",
                    name
                )));
            }
            if server.transport_type != "stdio" {
                return Err(FlowError::ConfigError(format!(
                    "Unsupported transportType '{}' for '{}'",
                    server.transport_type, name
                )));
            }
            if server.timeout == 0 {
                return Err(FlowError::ConfigError(format!(
                    "Server '{}' timeout must be greater than 0",
                    name
                )));
            }
        }

        for (name, workflow) in &self.workflows {
            workflow.validate(name)?;
            for server_name in &workflow.backend_services_used {
                if !self.mcp_servers.contains_key(server_name) {
                    return Err(FlowError::ConfigError(format!(
                        "Workflow '{}' uses undefined MCP server: '{}'",
                        name, server_name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn workflow(&self, name: &str) -> Result<&WorkflowSpec, FlowError> {
        self.workflows.get(name).ok_or_else(|| {
            log::warn!("Attempt to get undefined workflow: '{}'", name);
            FlowError::ConfigError(format!("Workflow '{}' not defined", name))
        })
    }

    pub fn mcp_server(&self, name: &str) -> Result<&McpServerConfig, FlowError> {
        self.mcp_servers.get(name).ok_or_else(|| {
            log::warn!("Attempt to get undefined MCP server: '{}'", name);
            FlowError::ConfigError(format!("MCP server '{}' not defined", name))
        })
    }

    pub fn list_workflows(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }
}

fn default_transport() -> String { "stdio".to_string() }
fn default_max_turns() -> usize { 5 }
pub fn default_mcp_timeout() -> u64 { 30 }
pub fn default_mcp_token_limit() -> u32 { 2000 }
