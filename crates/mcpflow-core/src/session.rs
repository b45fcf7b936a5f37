//! Workflow sessions.
//!
//! A session owns the connected backend services, the tool registry built
//! from them and the model gateway for one workflow. Services are acquired in
//! [`WorkflowSession::connect`] and released in [`WorkflowSession::close`];
//! if setup fails part way, whatever was already connected is released
//! before the error is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, WorkflowSpec};
use crate::errors::FlowError;
use crate::llm::{GeminiGateway, LlmGateway};
use crate::orchestrator::{Orchestrator, QueryRun};
use crate::tools::{BackendService, RMCPClient, ToolRegistry};
use crate::trace::QueryObserver;

pub struct WorkflowSession {
    name: String,
    spec: WorkflowSpec,
    registry: ToolRegistry,
    gateway: Box<dyn LlmGateway>,
    closed: AtomicBool,
}

impl WorkflowSession {
    /// Connect every server the workflow uses and prepare the gateway.
    pub async fn connect(workflow_name: &str, config: &AppConfig) -> Result<Self, FlowError> {
        let spec = config.workflow(workflow_name)?.clone();
        spec.validate(workflow_name)?;
        log::info!(
            "Setting up workflow '{}' with model '{}' and servers {:?}",
            workflow_name,
            spec.model_name,
            spec.backend_services_used
        );

        let server_configs = spec
            .backend_services_used
            .iter()
            .map(|name| config.mcp_server(name))
            .collect::<Result<Vec<_>, _>>()?;

        let results = join_all(server_configs.into_iter().map(RMCPClient::connect)).await;
        let mut services: Vec<Arc<dyn BackendService>> = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(client) => services.push(Arc::new(client)),
                Err(e) => {
                    log::error!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(error) = first_error {
            release(&services).await;
            return Err(error);
        }

        let gateway = GeminiGateway::from_config(config, &spec.model_name);
        Self::from_parts(workflow_name, spec, Box::new(gateway), services).await
    }

    /// Build a session from already-connected services, in priority order.
    pub async fn from_parts(
        workflow_name: impl Into<String>,
        spec: WorkflowSpec,
        gateway: Box<dyn LlmGateway>,
        services: Vec<Arc<dyn BackendService>>,
    ) -> Result<Self, FlowError> {
        let name = workflow_name.into();
        let mut entries = Vec::with_capacity(services.len());
        for service in &services {
            match service.list_tools().await {
                Ok(tools) => {
                    log::info!(
                        "Service '{}' offers {} tools: {:?}",
                        service.name(),
                        tools.len(),
                        tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()
                    );
                    entries.push((service.clone(), tools));
                }
                Err(e) => {
                    log::error!("Failed to list tools from '{}': {}", service.name(), e);
                    release(&services).await;
                    return Err(e);
                }
            }
        }

        let registry = ToolRegistry::build(entries);
        log::info!("Workflow '{}' ready with {} tools", name, registry.len());
        Ok(Self {
            name,
            spec,
            registry,
            gateway,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.registry.tool_names()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Answer one query. Operational failures come back as markers in the text.
    pub async fn process_query(
        &self,
        query: &str,
        observer: &dyn QueryObserver,
        cancel: CancellationToken,
    ) -> Result<String, FlowError> {
        self.run_query(query, observer, cancel).await.map(|run| run.answer)
    }

    pub async fn run_query(
        &self,
        query: &str,
        observer: &dyn QueryObserver,
        cancel: CancellationToken,
    ) -> Result<QueryRun, FlowError> {
        if self.is_closed() {
            return Err(FlowError::NotInitialized(format!(
                "Workflow session '{}' is closed",
                self.name
            )));
        }
        if query.trim().is_empty() {
            return Err(FlowError::InternalError("Query cannot be empty".to_string()));
        }
        log::info!("Processing query for workflow '{}': {}", self.name, query);

        Orchestrator::new(&self.spec, &self.registry, self.gateway.as_ref())
            .with_observer(observer)
            .with_cancellation(cancel)
            .run_query(query)
            .await
    }

    /// Release every backend service. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Closing workflow session '{}'", self.name);
        release(self.registry.services()).await;
    }
}

async fn release(services: &[Arc<dyn BackendService>]) {
    let results = join_all(services.iter().map(|service| async move {
        (service.name().to_string(), service.shutdown().await)
    }))
    .await;
    for (name, result) in results {
        if let Err(e) = result {
            log::warn!("Error shutting down service '{}': {}", name, e);
        }
    }
}
