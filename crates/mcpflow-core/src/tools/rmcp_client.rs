//! MCP backend service over a child-process stdio transport
//!
//! Each configured server is spawned as a child process and driven through
//! `rmcp`. Tool results are classified into a [`ToolOutput`] here, at the
//! service boundary, so nothing downstream has to inspect raw MCP content.

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, Content, RawContent, ResourceContents, Tool},
    service::{DynService, RunningService, ServiceExt},
    transport::TokioChildProcess,
    RoleClient,
};
use serde_json::{Map, Value};
use std::time::Duration;
use tiktoken_rs::p50k_base;
use tokio::process::Command;
use tokio::sync::RwLock;

use super::BackendService;
use crate::config::McpServerConfig;
use crate::conversation::ToolOutput;
use crate::errors::FlowError;
use crate::schema::ToolDescriptor;

const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(30);
const TRUNCATION_MESSAGE: &str = " [...TRUNCATED...]";

type ClientService = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

pub struct RMCPClient {
    name: String,
    service: RwLock<Option<ClientService>>,
    call_timeout: Duration,
    token_limit: u32,
}

impl RMCPClient {
    /// Spawn the server process and complete the MCP handshake.
    pub async fn connect(config: &McpServerConfig) -> Result<Self, FlowError> {
        log::info!(
            "Starting MCP server '{}' with command: {} {:?}",
            config.name,
            config.command,
            config.args
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if let Some(working_dir) = &config.working_dir {
            log::debug!("Setting working directory: {}", working_dir.display());
            cmd.current_dir(working_dir);
        }

        if !config.env.is_empty() {
            log::debug!(
                "Setting {} environment variables for '{}'",
                config.env.len(),
                config.name
            );
            for (key, value) in &config.env {
                cmd.env(key, value);
            }
        }

        let transport = TokioChildProcess::new(cmd).map_err(|e| {
            FlowError::connection(&config.name, format!("failed to spawn process: {}", e))
        })?;

        let service_handler: Box<dyn DynService<RoleClient>> = Box::new(());
        let service = service_handler.serve(transport).await.map_err(|e| {
            log::error!("MCP initialize handshake with '{}' failed: {}", config.name, e);
            FlowError::connection(&config.name, format!("initialize failed: {}", e))
        })?;

        log::info!(
            "Connected to MCP server '{}': {:?}",
            config.name,
            service.peer_info()
        );

        Ok(Self {
            name: config.name.clone(),
            service: RwLock::new(Some(service)),
            call_timeout: Duration::from_secs(config.timeout),
            token_limit: config.token_limit,
        })
    }

    fn classify(&self, tool_name: &str, content: &[Content]) -> ToolOutput {
        classify_content(tool_name, content, self.token_limit)
    }
}

fn convert_tool(tool: &Tool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name.to_string(),
        description: tool.description.as_ref().map(|d| d.to_string()),
        input_schema: Value::Object(tool.input_schema.as_ref().clone()),
    }
}

fn describe_content(raw: &RawContent) -> String {
    match raw {
        RawContent::Text(text_content) => text_content.text.clone(),
        RawContent::Image(image_content) => format!(
            "Image ({}, {} bytes)",
            image_content.mime_type,
            image_content.data.len()
        ),
        RawContent::Resource(resource_content) => match &resource_content.resource {
            ResourceContents::TextResourceContents { uri, .. } => format!("Resource: {}", uri),
            ResourceContents::BlobResourceContents { uri, .. } => format!("Resource: {}", uri),
        },
        RawContent::Audio(audio_content) => format!(
            "Audio ({}, {} bytes)",
            audio_content.mime_type,
            audio_content.data.len()
        ),
    }
}

/// Sort raw MCP content into text, a JSON object, or something else.
fn classify_content(tool_name: &str, content: &[Content], token_limit: u32) -> ToolOutput {
    if content.is_empty() {
        return ToolOutput::Text("Tool executed successfully (no content returned)".to_string());
    }

    let texts: Vec<&str> = content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect();

    if texts.is_empty() {
        let described: Vec<String> = content.iter().map(|c| describe_content(&c.raw)).collect();
        return ToolOutput::Other(described.join("\n"));
    }

    if texts.len() == 1 && content.len() == 1 {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(texts[0]) {
            return ToolOutput::Structured(map);
        }
    }

    let joined = content
        .iter()
        .map(|c| describe_content(&c.raw))
        .collect::<Vec<_>>()
        .join("\n");
    ToolOutput::Text(truncate_to_tokens(tool_name, joined, token_limit))
}

fn truncate_to_tokens(tool_name: &str, text: String, token_limit: u32) -> String {
    let bpe = match p50k_base() {
        Ok(bpe) => bpe,
        Err(e) => {
            log::warn!("Tokenizer unavailable, not truncating '{}' output: {}", tool_name, e);
            return text;
        }
    };

    let limit = token_limit as usize;
    let mut tokens = bpe.encode_with_special_tokens(&text);
    if tokens.len() <= limit {
        return text;
    }

    log::warn!(
        "Truncating output of tool '{}' to {} tokens",
        tool_name,
        token_limit
    );
    tokens.truncate(limit);
    let mut truncated = bpe.decode(tokens).unwrap_or_default();
    truncated.push_str(TRUNCATION_MESSAGE);
    while bpe.encode_with_special_tokens(&truncated).len() > limit {
        truncated.pop();
    }
    truncated
}

#[async_trait]
impl BackendService for RMCPClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, FlowError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| FlowError::connection(&self.name, "not connected"))?;

        let response = tokio::time::timeout(LIST_TOOLS_TIMEOUT, service.list_tools(Default::default()))
            .await
            .map_err(|_| {
                log::error!("list_tools on '{}' timed out", self.name);
                FlowError::connection(&self.name, "timeout waiting for list_tools response")
            })?
            .map_err(|e| FlowError::connection(&self.name, format!("failed to list tools: {}", e)))?;

        let tools: Vec<ToolDescriptor> = response.tools.iter().map(convert_tool).collect();
        log::debug!(
            "Listed tools for '{}': {:?}",
            self.name,
            tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()
        );
        Ok(tools)
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolOutput, FlowError> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| {
            FlowError::tool(tool_name, format!("not connected to MCP server {}", self.name))
        })?;

        log::info!("Calling tool '{}' on server '{}'", tool_name, self.name);
        log::debug!("Full args for '{}': {:?}", tool_name, arguments);

        let request = CallToolRequestParam {
            name: tool_name.to_string().into(),
            arguments: if arguments.is_empty() {
                None
            } else {
                Some(arguments)
            },
        };

        let result = tokio::time::timeout(self.call_timeout, service.call_tool(request))
            .await
            .map_err(|_| {
                FlowError::tool(
                    tool_name,
                    format!("timed out after {}s", self.call_timeout.as_secs()),
                )
            })?
            .map_err(|e| FlowError::tool(tool_name, e.to_string()))?;

        if result.is_error.unwrap_or(false) {
            let message = result
                .content
                .iter()
                .map(|c| describe_content(&c.raw))
                .collect::<Vec<_>>()
                .join("\n");
            return Err(FlowError::tool(tool_name, message));
        }

        Ok(self.classify(tool_name, &result.content))
    }

    async fn shutdown(&self) -> Result<(), FlowError> {
        if let Some(service) = self.service.write().await.take() {
            service
                .cancel()
                .await
                .map_err(|e| FlowError::connection(&self.name, format!("failed to cancel service: {}", e)))?;
            log::info!("Disconnected from MCP server '{}'", self.name);
        }
        Ok(())
    }
}

impl Drop for RMCPClient {
    fn drop(&mut self) {
        if let Some(service) = self.service.get_mut().take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let name = self.name.clone();
                handle.spawn(async move {
                    if let Err(e) = service.cancel().await {
                        log::warn!("Failed to cancel service '{}' during drop: {}", name, e);
                    }
                });
            }
        }
    }
}
