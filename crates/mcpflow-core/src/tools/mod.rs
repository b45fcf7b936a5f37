//! Backend tool services and the session-wide tool registry
//!
//! A workflow may connect several MCP servers. Their tool lists are merged
//! into one [`ToolRegistry`] at session setup: the first service to declare a
//! name owns it and later declarations of the same name are shadowed. The
//! registry also holds the translated function declarations that are offered
//! to the model on every turn.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::conversation::ToolOutput;
use crate::errors::FlowError;
use crate::schema::{translate, FunctionDeclaration, ToolDescriptor};

pub mod rmcp_client;

pub use rmcp_client::RMCPClient;

/// A connected capability server.
#[async_trait]
pub trait BackendService: Send + Sync {
    fn name(&self) -> &str;
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, FlowError>;
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolOutput, FlowError>;
    async fn shutdown(&self) -> Result<(), FlowError>;
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    service: usize,
}

/// Read-only lookup from tool name to the service that implements it.
pub struct ToolRegistry {
    services: Vec<Arc<dyn BackendService>>,
    index: HashMap<String, usize>,
    tools: Vec<RegisteredTool>,
    declarations: Vec<FunctionDeclaration>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            services: Vec::new(),
            index: HashMap::new(),
            tools: Vec::new(),
            declarations: Vec::new(),
        }
    }

    /// Build the registry from services in workflow order.
    pub fn build(entries: Vec<(Arc<dyn BackendService>, Vec<ToolDescriptor>)>) -> Self {
        let mut registry = Self::empty();

        for (service, descriptors) in entries {
            let service_idx = registry.services.len();
            let service_name = service.name().to_string();
            registry.services.push(service);

            for descriptor in descriptors {
                if descriptor.name.trim().is_empty() {
                    log::warn!("Skipping unnamed tool advertised by service '{}'", service_name);
                    continue;
                }
                if let Some(&owner) = registry.index.get(&descriptor.name) {
                    log::warn!(
                        "Tool '{}' from service '{}' is shadowed by service '{}'",
                        descriptor.name,
                        service_name,
                        registry.services[owner].name()
                    );
                    continue;
                }

                let translation = translate(&descriptor);
                for diagnostic in &translation.diagnostics {
                    log::warn!("{}", diagnostic);
                }

                registry
                    .index
                    .insert(descriptor.name.clone(), registry.tools.len());
                registry.declarations.push(translation.declaration);
                registry.tools.push(RegisteredTool {
                    descriptor,
                    service: service_idx,
                });
            }
        }

        log::info!(
            "Tool registry built: {} tools from {} services",
            registry.tools.len(),
            registry.services.len()
        );
        registry
    }

    pub fn resolve(&self, tool_name: &str) -> Option<Arc<dyn BackendService>> {
        self.index
            .get(tool_name)
            .map(|&idx| self.services[self.tools[idx].service].clone())
    }

    /// Like [`resolve`](Self::resolve), but unknown names are a `ToolNotFound` error.
    pub fn require(&self, tool_name: &str) -> Result<Arc<dyn BackendService>, FlowError> {
        self.resolve(tool_name)
            .ok_or_else(|| FlowError::ToolNotFound(tool_name.to_string()))
    }

    pub fn descriptor(&self, tool_name: &str) -> Option<&ToolDescriptor> {
        self.index.get(tool_name).map(|&idx| &self.tools[idx].descriptor)
    }

    /// Declarations to offer the model, or `None` when no tools exist.
    pub fn declarations(&self) -> Option<&[FunctionDeclaration]> {
        if self.declarations.is_empty() {
            None
        } else {
            Some(&self.declarations)
        }
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.descriptor.name.as_str()).collect()
    }

    pub fn services(&self) -> &[Arc<dyn BackendService>] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
