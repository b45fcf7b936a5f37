//! Configuration loader for JSON/YAML files and environment resolution

use serde::de::DeserializeOwned;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::types::*;
use crate::errors::FlowError;
use crate::llm::gemini::DEFAULT_BASE_URL;

pub const MCP_SERVERS_FILE: &str = "mcp_servers";
pub const WORKFLOWS_FILE: &str = "workflows";
const EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];
const API_KEY_VARS: [&str; 2] = ["GOOGLE_API_KEY", "GEMINI_API_KEY"];

/// Explicit paths override the search locations.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    pub mcp_servers: Option<PathBuf>,
    pub workflows: Option<PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate the full application configuration.
    pub async fn load(paths: &ConfigPaths) -> Result<AppConfig, FlowError> {
        let dotenv = Path::new(".env");
        if dotenv.exists() {
            Self::load_env_file(dotenv)?;
        }

        let api_key = Self::resolve_api_key()?;

        let servers_path = match &paths.mcp_servers {
            Some(path) => path.clone(),
            None => Self::find_config_file(MCP_SERVERS_FILE)?,
        };
        let workflows_path = match &paths.workflows {
            Some(path) => path.clone(),
            None => Self::find_config_file(WORKFLOWS_FILE)?,
        };

        let servers: McpServersDocument = Self::load_document(&servers_path, "mcpServers").await?;
        let workflows: WorkflowsDocument = Self::load_document(&workflows_path, "workflows").await?;

        let config = Self::assemble(api_key, servers, workflows)?;
        log::info!("Application configuration loaded successfully.");
        Ok(config)
    }

    /// Build a configuration from in-memory documents.
    pub fn from_strs(
        api_key: &str,
        mcp_servers: &str,
        workflows: &str,
        format: ConfigFormat,
    ) -> Result<AppConfig, FlowError> {
        let servers: McpServersDocument = Self::parse(mcp_servers, format, "mcpServers")?;
        let workflows: WorkflowsDocument = Self::parse(workflows, format, "workflows")?;
        Self::assemble(api_key.to_string(), servers, workflows)
    }

    fn assemble(
        api_key: String,
        servers: McpServersDocument,
        workflows: WorkflowsDocument,
    ) -> Result<AppConfig, FlowError> {
        let mut mcp_servers = servers.mcp_servers;
        for (name, server) in mcp_servers.iter_mut() {
            server.name = name.clone();
        }

        let gemini_base_url =
            env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let config = AppConfig {
            api_key,
            gemini_base_url,
            mcp_servers,
            workflows: workflows.workflows,
        };
        config.validate()?;
        log::debug!("MCP server and workflow configurations validated.");
        Ok(config)
    }

    fn resolve_api_key() -> Result<String, FlowError> {
        API_KEY_VARS
            .iter()
            .find_map(|var| env::var(var).ok().filter(|v| !v.trim().is_empty()))
            .ok_or_else(|| {
                log::error!("GOOGLE_API_KEY or GEMINI_API_KEY not found in environment.");
                FlowError::ConfigError(
                    "GOOGLE_API_KEY or GEMINI_API_KEY not found in environment".to_string(),
                )
            })
    }

    /// Candidate directories, most specific first.
    pub fn search_dirs() -> Vec<PathBuf> {
        let mut dirs_list = Vec::new();
        if let Ok(cwd) = env::current_dir() {
            dirs_list.push(cwd);
        }
        if let Some(config_dir) = dirs::config_dir() {
            dirs_list.push(config_dir.join("mcpflow"));
        }
        if let Some(home) = dirs::home_dir() {
            dirs_list.push(home.join(".mcpflow"));
        }
        dirs_list
    }

    pub fn find_config_file(stem: &str) -> Result<PathBuf, FlowError> {
        Self::find_in(&Self::search_dirs(), stem)
    }

    fn find_in(dirs_list: &[PathBuf], stem: &str) -> Result<PathBuf, FlowError> {
        for dir in dirs_list {
            for ext in EXTENSIONS {
                let candidate = dir.join(format!("{}.{}", stem, ext));
                if candidate.exists() {
                    log::debug!("Found configuration file at {}", candidate.display());
                    return Ok(candidate);
                }
            }
        }
        log::error!("Could not find {} in standard locations.", stem);
        Err(FlowError::ConfigError(format!(
            "Could not find {}.json (or .yaml) in the working directory, ~/.config/mcpflow/ or ~/.mcpflow/",
            stem
        )))
    }

    async fn load_document<T: DeserializeOwned>(path: &Path, expected_key: &str) -> Result<T, FlowError> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            FlowError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let document = Self::parse(&content, ConfigFormat::from_path(path), expected_key)
            .map_err(|e| FlowError::ConfigError(format!("{}: {}", path.display(), e)))?;
        log::info!("Loaded {} from {}", expected_key, path.display());
        Ok(document)
    }

    fn parse<T: DeserializeOwned>(content: &str, format: ConfigFormat, expected_key: &str) -> Result<T, FlowError> {
        // Parse to a generic value first so a missing top-level key gets a clear message.
        let value: serde_json::Value = match format {
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| FlowError::ConfigError(format!("Invalid JSON: {}", e)))?,
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| FlowError::ConfigError(format!("Invalid YAML: {}", e)))?,
        };
        if value.get(expected_key).is_none() {
            return Err(FlowError::ConfigError(format!("Missing '{}' key", expected_key)));
        }
        serde_json::from_value(value)
            .map_err(|e| FlowError::ConfigError(format!("Invalid '{}' section: {}", expected_key, e)))
    }

    /// Load `KEY=value` pairs into the process environment without
    /// overriding variables that are already set.
    fn load_env_file<P: AsRef<Path>>(path: P) -> Result<(), FlowError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            FlowError::ConfigError(format!(
                "Failed to read env file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if env::var_os(key).is_none() {
                    env::set_var(key, value);
                }
            }
        }

        log::debug!("Loaded environment from {}", path.as_ref().display());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}
