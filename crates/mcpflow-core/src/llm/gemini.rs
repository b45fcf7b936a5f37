//! Google Gemini `generateContent` gateway
//!
//! Talks to the Generative Language REST API directly with `reqwest`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{GatewayResponse, LlmGateway};
use crate::config::AppConfig;
use crate::conversation::{ConversationState, Part, Role, Turn};
use crate::errors::FlowError;
use crate::schema::{declarations_to_value, FunctionDeclaration};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiGateway {
    api_key: String,
    model: String,
    client: Client,
    base_url: String,
}

impl GeminiGateway {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            model,
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &AppConfig, model: &str) -> Self {
        log::info!("Gemini gateway initialized for model: {}", model);
        Self::with_base_url(
            config.api_key.clone(),
            model.to_string(),
            config.gemini_base_url.clone(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
    // Parts this client does not use (inline data, thoughts, ...).
    Unknown(Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetails,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetails {
    code: u16,
    message: String,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
    }
}

fn to_gemini_contents(conversation: &ConversationState) -> Vec<GeminiContent> {
    conversation
        .turns()
        .iter()
        .map(|turn| GeminiContent {
            role: Some(role_name(turn.role).to_string()),
            parts: turn
                .parts
                .iter()
                .map(|part| match part {
                    Part::Text(text) => GeminiPart::Text { text: text.clone() },
                    Part::FunctionCall { name, args } => GeminiPart::FunctionCall {
                        function_call: GeminiFunctionCall {
                            name: name.clone(),
                            args: Some(args.clone()),
                        },
                    },
                    Part::FunctionResponse { name, response } => GeminiPart::FunctionResponse {
                        function_response: GeminiFunctionResponse {
                            name: name.clone(),
                            response: response.clone(),
                        },
                    },
                })
                .collect(),
        })
        .collect()
}

fn from_gemini_response(response: GeminiResponse) -> GatewayResponse {
    let candidates = response
        .candidates
        .into_iter()
        .map(|candidate| {
            if let Some(reason) = &candidate.finish_reason {
                log::debug!("Gemini candidate finish reason: {}", reason);
            }
            let parts = candidate
                .content
                .map(|c| c.parts)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|part| match part {
                    GeminiPart::Text { text } => Some(Part::Text(text)),
                    GeminiPart::FunctionCall { function_call } => Some(Part::FunctionCall {
                        name: function_call.name,
                        args: function_call.args.unwrap_or_default(),
                    }),
                    GeminiPart::FunctionResponse { .. } => None,
                    GeminiPart::Unknown(value) => {
                        log::debug!("Ignoring unsupported Gemini part: {}", value);
                        None
                    }
                })
                .collect();
            Turn::model(parts)
        })
        .collect();

    GatewayResponse { candidates }
}

#[async_trait]
impl LlmGateway for GeminiGateway {
    async fn generate(
        &self,
        conversation: &ConversationState,
        tools: Option<&[FunctionDeclaration]>,
    ) -> Result<GatewayResponse, FlowError> {
        let request = GeminiRequest {
            contents: to_gemini_contents(conversation),
            tools: tools
                .filter(|t| !t.is_empty())
                .map(|t| vec![declarations_to_value(t)]),
        };

        log::info!(
            "Sending request to LLM model: {}. History length: {}.",
            self.model,
            conversation.len()
        );
        log::debug!("LLM request contents (last turn): {:?}", conversation.last());

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| FlowError::GatewayError(format!("Gemini API request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            if let Ok(gemini_error) = serde_json::from_str::<GeminiError>(&error_text) {
                return Err(FlowError::GatewayError(format!(
                    "Gemini API error {}: {}",
                    gemini_error.error.code, gemini_error.error.message
                )));
            }

            return Err(FlowError::GatewayError(format!(
                "Gemini API request failed with status {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            FlowError::GatewayError(format!("Failed to parse Gemini response: {}", e))
        })?;

        log::info!("LLM API call successful to model {}.", self.model);
        Ok(from_gemini_response(gemini_response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::error_payload;
    use crate::schema::{translate, ToolDescriptor};
    use serde_json::json;

    #[test]
    fn test_gateway_creation() {
        let gateway = GeminiGateway::new("test-key".to_string(), "gemini-2.0-flash".to_string());
        assert_eq!(gateway.model(), "gemini-2.0-flash");
        assert_eq!(gateway.base_url, DEFAULT_BASE_URL);

        let custom = GeminiGateway::with_base_url(
            "k".to_string(),
            "m".to_string(),
            "http://localhost:8080/".to_string(),
        );
        assert_eq!(custom.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_conversation_serialization() {
        let mut state = ConversationState::new("What is the weather in Oslo?");
        let mut args = Map::new();
        args.insert("city".to_string(), json!("Oslo"));
        state.push_model_turn(vec![Part::function_call("get_forecast", args)]);
        state
            .push_function_response("get_forecast", error_payload("tool not found"))
            .unwrap();

        let value = serde_json::to_value(to_gemini_contents(&state)).unwrap();
        assert_eq!(value[0]["role"], "user");
        assert_eq!(value[0]["parts"][0]["text"], "What is the weather in Oslo?");
        assert_eq!(value[1]["role"], "model");
        assert_eq!(value[1]["parts"][0]["functionCall"]["name"], "get_forecast");
        assert_eq!(value[1]["parts"][0]["functionCall"]["args"]["city"], "Oslo");
        assert_eq!(value[2]["role"], "user");
        assert_eq!(
            value[2]["parts"][0]["functionResponse"]["response"]["error"],
            "tool not found"
        );
    }

    #[test]
    fn test_request_without_tools_omits_field() {
        let request = GeminiRequest {
            contents: to_gemini_contents(&ConversationState::new("hello")),
            tools: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn test_request_with_tools() {
        let declaration = translate(&ToolDescriptor::new(
            "get_forecast",
            "Forecast",
            json!({"properties": {"city": {"type": "string"}}}),
        ))
        .declaration;
        let request = GeminiRequest {
            contents: vec![],
            tools: Some(vec![declarations_to_value(&[declaration])]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value["tools"][0]["functionDeclarations"][0]["parameters"]["properties"]["city"]["type"],
            "string"
        );
    }

    #[test]
    fn test_response_parsing() {
        let raw = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Let me check."},
                        {"functionCall": {"name": "get_forecast", "args": {"city": "Oslo"}}},
                        {"functionCall": {"name": "no_args"}}
                    ]
                },
                "finishReason": "STOP"
            }]
        });
        let parsed: GeminiResponse = serde_json::from_value(raw).unwrap();
        let response = from_gemini_response(parsed);
        assert_eq!(response.candidates.len(), 1);
        let turn = &response.candidates[0];
        assert_eq!(turn.role, Role::Model);
        assert_eq!(turn.parts[0], Part::text("Let me check."));
        assert!(turn.has_function_call("get_forecast"));
        assert!(matches!(&turn.parts[2], Part::FunctionCall { args, .. } if args.is_empty()));
    }

    #[test]
    fn test_response_without_candidates() {
        let parsed: GeminiResponse =
            serde_json::from_value(json!({"promptFeedback": {"blockReason": "SAFETY"}})).unwrap();
        assert!(from_gemini_response(parsed).candidates.is_empty());
    }
}
