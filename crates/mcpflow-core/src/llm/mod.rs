//! Language model gateway abstraction.
//!
//! The orchestrator only needs one operation from a model provider: given the
//! conversation so far and the tools on offer, return zero or more candidate
//! turns. Provider wire formats live behind this trait.

use async_trait::async_trait;

use crate::conversation::{ConversationState, Turn};
use crate::errors::FlowError;
use crate::schema::FunctionDeclaration;

pub mod gemini;

pub use gemini::GeminiGateway;

#[derive(Debug, Clone, Default)]
pub struct GatewayResponse {
    pub candidates: Vec<Turn>,
}

impl GatewayResponse {
    pub fn single(turn: Turn) -> Self {
        Self {
            candidates: vec![turn],
        }
    }
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn generate(
        &self,
        conversation: &ConversationState,
        tools: Option<&[FunctionDeclaration]>,
    ) -> Result<GatewayResponse, FlowError>;
}
