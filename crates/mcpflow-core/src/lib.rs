//! Tool-calling conversation engine connecting a language model to MCP servers.
//!
//! A workflow names a model, a prompt template and the MCP servers whose
//! tools the model may call. For each user query the engine runs a bounded
//! loop: ask the model, run the one tool it requested, feed the result back,
//! and stop once the model answers in plain text.
//!
//! # Architecture Overview
//!
//! - **Configuration**: server and workflow documents in JSON or YAML
//! - **Schema translation**: MCP input schemas to model function declarations
//! - **Tool registry**: first-registered-wins name resolution across services
//! - **Orchestration**: the per-query turn loop and its answer markers
//! - **Sessions**: scoped acquisition and release of backend connections

pub mod config;
pub mod conversation;
pub mod errors;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod schema;
pub mod session;
pub mod tools;
pub mod trace;

pub use config::{AppConfig, ConfigLoader, ConfigPaths, McpServerConfig, WorkflowSpec};
pub use conversation::{ConversationState, Part, Role, ToolOutput, Turn};
pub use errors::FlowError;
pub use llm::{GatewayResponse, GeminiGateway, LlmGateway};
pub use orchestrator::{Orchestrator, QueryRun, Termination};
pub use schema::{FunctionDeclaration, ToolDescriptor};
pub use session::WorkflowSession;
pub use tools::{BackendService, ToolRegistry};
pub use trace::{LogObserver, QueryEvent, QueryObserver};
