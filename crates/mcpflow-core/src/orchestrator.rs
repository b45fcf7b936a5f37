//! Multi-turn tool-calling loop for a single query.
//!
//! Each turn sends the conversation to the model, appends the model's turn,
//! and services at most one function call before asking the model again. The
//! loop ends when the model answers without calling a tool, when the gateway
//! fails or returns nothing, when the query is cancelled, or when the turn
//! budget runs out. Everything that goes wrong inside the loop ends up as a
//! bracketed marker in the returned answer rather than as an error.

use std::future::Future;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::WorkflowSpec;
use crate::conversation::{error_payload, ConversationState, Part};
use crate::errors::FlowError;
use crate::llm::LlmGateway;
use crate::prompt::render_template;
use crate::tools::ToolRegistry;
use crate::trace::{LogObserver, QueryEvent, QueryObserver};

pub const TOOL_NOT_FOUND: &str = "tool not found";
const SNIPPET_CHARS: usize = 150;

/// Why the turn loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed,
    GatewayFailed,
    NoCandidates,
    MaxTurnsReached,
    Cancelled,
}

/// Outcome of one query, including the full conversation.
#[derive(Debug, Clone)]
pub struct QueryRun {
    pub answer: String,
    pub conversation: ConversationState,
    pub llm_calls: usize,
    pub termination: Termination,
}

/// Text fragments and markers in emission order.
/// Markers do not count as model text.
#[derive(Debug, Default)]
struct AnswerBuffer {
    text: String,
    has_model_text: bool,
}

impl AnswerBuffer {
    fn push_text(&mut self, fragment: &str, first_in_turn: bool) {
        if first_in_turn && !self.text.is_empty() && !self.text.ends_with(char::is_whitespace) {
            self.text.push('\n');
        }
        self.text.push_str(fragment);
        self.has_model_text = true;
    }

    fn push_marker(&mut self, marker: impl AsRef<str>) {
        self.text.push('\n');
        self.text.push_str(marker.as_ref());
    }

    fn has_model_text(&self) -> bool {
        self.has_model_text
    }

    fn finish(self) -> String {
        self.text.trim().to_string()
    }
}

pub struct Orchestrator<'a> {
    spec: &'a WorkflowSpec,
    registry: &'a ToolRegistry,
    gateway: &'a dyn LlmGateway,
    observer: &'a dyn QueryObserver,
    cancel: Option<CancellationToken>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(spec: &'a WorkflowSpec, registry: &'a ToolRegistry, gateway: &'a dyn LlmGateway) -> Self {
        Self {
            spec,
            registry,
            gateway,
            observer: &LogObserver,
            cancel: None,
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn QueryObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run the query and return only the final answer text.
    pub async fn process_query(&self, user_query: &str) -> Result<String, FlowError> {
        self.run_query(user_query).await.map(|run| run.answer)
    }

    /// Run the query. Only a broken prompt template is returned as an error.
    pub async fn run_query(&self, user_query: &str) -> Result<QueryRun, FlowError> {
        let initial_prompt = render_template(&self.spec.initial_prompt_template, user_query)?;
        log::debug!("Initial prompt for LLM: {}", initial_prompt);

        let declarations = self.registry.declarations();
        let max_turns = self.spec.max_turns;
        let mut conversation = ConversationState::new(initial_prompt);
        let mut answer = AnswerBuffer::default();
        let mut llm_calls = 0;
        let mut termination = None;

        for turn in 1..=max_turns {
            if self.is_cancelled() {
                termination = Some(self.cancelled(&mut answer));
                break;
            }
            self.observer.on_event(&QueryEvent::TurnStarted { turn, max_turns });
            log::debug!("Conversation history length before LLM call: {}", conversation.len());

            llm_calls += 1;
            let response = match self
                .until_cancelled(self.gateway.generate(&conversation, declarations))
                .await
            {
                None => {
                    termination = Some(self.cancelled(&mut answer));
                    break;
                }
                Some(Err(error)) => {
                    let event = QueryEvent::GatewayFailed { error: &error };
                    self.observer.on_event(&event);
                    answer.push_marker(event.to_string());
                    termination = Some(Termination::GatewayFailed);
                    break;
                }
                Some(Ok(response)) => response,
            };

            let Some(model_turn) = response.candidates.into_iter().next() else {
                self.observer.on_event(&QueryEvent::NoCandidates);
                answer.push_marker(QueryEvent::NoCandidates.to_string());
                termination = Some(Termination::NoCandidates);
                break;
            };

            let call = self.scan_parts(&model_turn.parts, &mut answer);
            conversation.push_model_turn(model_turn.parts);

            let Some((name, args)) = call else {
                log::info!("No function call in LLM response (turn {}), treating it as the final answer", turn);
                if !answer.has_model_text() {
                    self.observer.on_event(&QueryEvent::NoFurtherOutput);
                    answer.push_marker(QueryEvent::NoFurtherOutput.to_string());
                }
                termination = Some(Termination::Completed);
                break;
            };

            match self.dispatch(&name, args, &mut answer).await {
                Some(payload) => {
                    log::debug!("Adding tool response for '{}' to history: {:?}", name, payload);
                    conversation.push_function_response(&name, payload)?;
                }
                None => {
                    conversation.push_function_response(&name, error_payload("cancelled"))?;
                    termination = Some(self.cancelled(&mut answer));
                    break;
                }
            }
        }

        let termination = match termination {
            Some(termination) => termination,
            None => {
                self.observer.on_event(&QueryEvent::MaxTurnsReached { max_turns });
                if !answer.has_model_text() {
                    answer.push_marker("[Max interaction turns reached. No final text generated.]");
                } else {
                    answer.push_marker("[Max interaction turns reached.]");
                }
                Termination::MaxTurnsReached
            }
        };

        let answer = answer.finish();
        log::info!("Final response for query ({} LLM calls): {:?}", llm_calls, termination);
        Ok(QueryRun {
            answer,
            conversation,
            llm_calls,
            termination,
        })
    }

    /// Collect text and return the first function call, ignoring later parts.
    fn scan_parts(&self, parts: &[Part], answer: &mut AnswerBuffer) -> Option<(String, Map<String, Value>)> {
        let mut first_text = true;
        for part in parts {
            match part {
                Part::Text(text) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    self.observer.on_event(&QueryEvent::ModelText { text });
                    answer.push_text(text, first_text);
                    first_text = false;
                }
                Part::FunctionCall { name, args } => {
                    let calls = parts.iter().filter(|p| matches!(p, Part::FunctionCall { .. })).count();
                    if calls > 1 {
                        log::warn!(
                            "Model requested {} tool calls in one turn; servicing only '{}'",
                            calls,
                            name
                        );
                    }
                    return Some((name.clone(), args.clone()));
                }
                Part::FunctionResponse { name, .. } => {
                    log::warn!("Ignoring function response part for '{}' in a model turn", name);
                }
            }
        }
        None
    }

    /// Invoke the tool and build the function response payload.
    /// Returns `None` only when the query was cancelled mid-call.
    async fn dispatch(
        &self,
        name: &str,
        args: Map<String, Value>,
        answer: &mut AnswerBuffer,
    ) -> Option<Map<String, Value>> {
        self.observer.on_event(&QueryEvent::ToolRequested { name, args: &args });

        let service = match self.registry.require(name) {
            Ok(service) => service,
            Err(error) => {
                log::debug!("{}", error);
                let event = QueryEvent::ToolNotFound { name };
                self.observer.on_event(&event);
                answer.push_marker(event.to_string());
                return Some(error_payload(TOOL_NOT_FOUND));
            }
        };

        match self.until_cancelled(service.call_tool(name, args)).await? {
            Ok(output) => {
                self.observer.on_event(&QueryEvent::ToolSucceeded {
                    name,
                    service: service.name(),
                    snippet: output.snippet(SNIPPET_CHARS),
                });
                Some(output.into_response())
            }
            Err(error) => {
                let event = QueryEvent::ToolFailed { name, error: &error };
                self.observer.on_event(&event);
                answer.push_marker(event.to_string());
                Some(error_payload(format!(
                    "Error executing MCP tool '{}' via '{}': {}",
                    name,
                    service.name(),
                    error.detail()
                )))
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    fn cancelled(&self, answer: &mut AnswerBuffer) -> Termination {
        self.observer.on_event(&QueryEvent::Cancelled);
        answer.push_marker(QueryEvent::Cancelled.to_string());
        Termination::Cancelled
    }

    async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                out = fut => Some(out),
            },
            None => Some(fut.await),
        }
    }
}
