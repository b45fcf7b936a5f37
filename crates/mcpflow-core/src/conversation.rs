//! Conversation data exchanged between the orchestrator and the LLM gateway
//!
//! A conversation is an append-only list of role-tagged turns. Each turn
//! carries ordered parts: plain text, a function call requested by the model,
//! or the response to such a call. The types mirror the content model used by
//! function-calling model APIs so gateways can translate them one to one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::FlowError;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    FunctionCall {
        name: String,
        args: Map<String, Value>,
    },
    FunctionResponse {
        name: String,
        response: Map<String, Value>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn function_call(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Part::FunctionCall {
            name: name.into(),
            args,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    pub fn has_function_call(&self, name: &str) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, Part::FunctionCall { name: n, .. } if n == name))
    }
}

/// Ordered history for a single query.
///
/// Turns can only be appended. A function response is accepted only when an
/// earlier model turn contains a call to the same function, so the history
/// handed to the model is always well formed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new(initial_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::user_text(initial_prompt)],
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn push_model_turn(&mut self, parts: Vec<Part>) {
        self.turns.push(Turn::model(parts));
    }

    pub fn push_function_response(
        &mut self,
        name: &str,
        response: Map<String, Value>,
    ) -> Result<(), FlowError> {
        let answered = self
            .turns
            .iter()
            .any(|t| t.role == Role::Model && t.has_function_call(name));
        if !answered {
            return Err(FlowError::InternalError(format!(
                "function response for '{}' has no preceding function call",
                name
            )));
        }

        self.turns.push(Turn {
            role: Role::User,
            parts: vec![Part::FunctionResponse {
                name: name.to_string(),
                response,
            }],
        });
        Ok(())
    }
}

/// Result of a tool invocation, classified once at the service boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Structured(Map<String, Value>),
    Other(String),
}

impl ToolOutput {
    /// Payload placed in the function response sent back to the model.
    pub fn into_response(self) -> Map<String, Value> {
        match self {
            ToolOutput::Structured(map) => map,
            ToolOutput::Text(text) | ToolOutput::Other(text) => {
                let mut map = Map::new();
                map.insert("output".to_string(), Value::String(text));
                map
            }
        }
    }

    pub fn snippet(&self, max_chars: usize) -> String {
        let full = match self {
            ToolOutput::Text(text) | ToolOutput::Other(text) => text.clone(),
            ToolOutput::Structured(map) => Value::Object(map.clone()).to_string(),
        };
        let flat = full.replace('\n', " ");
        if flat.chars().count() > max_chars {
            let cut: String = flat.chars().take(max_chars).collect();
            format!("{}...", cut)
        } else {
            flat
        }
    }
}

pub fn error_payload(message: impl Into<String>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("error".to_string(), Value::String(message.into()));
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_response_requires_prior_call() {
        let mut state = ConversationState::new("hello");
        let err = state.push_function_response("lookup", Map::new());
        assert!(err.is_err());
        assert_eq!(state.len(), 1);

        state.push_model_turn(vec![Part::function_call("lookup", Map::new())]);
        state
            .push_function_response("lookup", error_payload("tool not found"))
            .unwrap();
        assert_eq!(state.len(), 3);
        assert_eq!(state.last().unwrap().role, Role::User);
    }

    #[test]
    fn test_tool_output_wrapping() {
        let text = ToolOutput::Text("42".to_string()).into_response();
        assert_eq!(Value::Object(text), json!({"output": "42"}));

        let mut structured = Map::new();
        structured.insert("status".to_string(), json!("ok"));
        let passed = ToolOutput::Structured(structured.clone()).into_response();
        assert_eq!(passed, structured);

        let other = ToolOutput::Other("Image (image/png, 12 bytes)".to_string()).into_response();
        assert_eq!(other["output"], "Image (image/png, 12 bytes)");
    }

    #[test]
    fn test_snippet_flattens_and_truncates() {
        let output = ToolOutput::Text("line one\nline two".to_string());
        assert_eq!(output.snippet(100), "line one line two");
        assert_eq!(output.snippet(4), "line...");
    }
}
