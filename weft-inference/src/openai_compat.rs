// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::llm::{ChatMessage, ChatOutput, ChatRole, LlmClient, ReasoningEffort, ToolCall};
use crate::{InferenceError, ToolDefinition};

/// Hard cap on one model call.
const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
///
/// Structured output uses the strict `json_schema` response format. Reasoning
/// models return their chain of thought in a separate `reasoning_content`
/// block, which is surfaced as [`ChatOutput::thinking`].
pub struct OpenAiCompatClient {
    provider_name: String,
    base_url: String,
    api_key: String,
    model: String,
    reasoning_effort: Option<ReasoningEffort>,
    context_window_tokens: usize,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        provider_name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        context_window_tokens: usize,
    ) -> Result<Self, InferenceError> {
        Ok(Self {
            provider_name: provider_name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            reasoning_effort: None,
            context_window_tokens,
            client: reqwest::Client::builder()
                .timeout(LLM_CALL_TIMEOUT)
                .build()
                .map_err(|error| InferenceError::Configuration(error.to_string()))?,
        })
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    async fn post_chat(&self, mut body: JsonValue) -> Result<JsonValue, InferenceError> {
        if let Some(effort) = self.reasoning_effort {
            body["reasoning_effort"] = json!(effort.as_str());
        }
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    InferenceError::Timeout(error.to_string())
                } else {
                    InferenceError::Unavailable(error.to_string())
                }
            })?;
        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<f64>().ok())
                .unwrap_or(1.0);
            return Err(InferenceError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            return Err(InferenceError::Unavailable(format!("{status}")));
        }
        if !status.is_success() {
            return Err(InferenceError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json()
            .await
            .map_err(|error| InferenceError::InvalidResponse(error.to_string()))
    }

    fn message_payload(messages: &[ChatMessage]) -> Vec<JsonValue> {
        messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                };
                let mut payload = json!({ "role": role, "content": message.content });
                if let Some(tool_call_id) = &message.tool_call_id {
                    payload["tool_call_id"] = json!(tool_call_id);
                }
                if !message.tool_calls.is_empty() {
                    payload["tool_calls"] = json!(message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                },
                            })
                        })
                        .collect::<Vec<_>>());
                }
                payload
            })
            .collect()
    }

    fn parse_message(payload: &JsonValue) -> Result<ChatOutput, InferenceError> {
        let message = payload
            .pointer("/choices/0/message")
            .ok_or_else(|| InferenceError::InvalidResponse("response has no message".to_string()))?;
        let thinking = message
            .get("reasoning_content")
            .and_then(JsonValue::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        let content = message
            .get("content")
            .and_then(JsonValue::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        let mut tool_calls = Vec::new();
        if let Some(raw_calls) = message.get("tool_calls").and_then(JsonValue::as_array) {
            for raw_call in raw_calls {
                let id = raw_call
                    .get("id")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                let name = raw_call
                    .pointer("/function/name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                let raw_arguments = raw_call
                    .pointer("/function/arguments")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("{}");
                let arguments = serde_json::from_str(raw_arguments).map_err(|error| {
                    InferenceError::InvalidResponse(format!(
                        "tool call `{name}` has malformed arguments: {error}"
                    ))
                })?;
                tool_calls.push(ToolCall { id, name, arguments });
            }
        }
        Ok(ChatOutput {
            thinking,
            content,
            tool_calls,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn provider_name(&self) -> String {
        self.provider_name.clone()
    }

    fn context_window_tokens(&self) -> usize {
        self.context_window_tokens
    }

    async fn structured_output(
        &self,
        prompt: &str,
        schema_name: &str,
        schema: &JsonValue,
    ) -> Result<JsonValue, InferenceError> {
        debug!(provider = %self.provider_name, model = %self.model, schema = schema_name, "structured-output");
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": schema_name, "schema": schema, "strict": true },
            },
        });
        let payload = self.post_chat(body).await?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                InferenceError::InvalidResponse("structured output has no content".to_string())
            })?;
        serde_json::from_str(content).map_err(|error| {
            InferenceError::InvalidResponse(format!("structured output is not JSON: {error}"))
        })
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatOutput, InferenceError> {
        debug!(
            provider = %self.provider_name,
            model = %self.model,
            num_messages = messages.len(),
            num_tools = tools.len(),
            "chat-turn"
        );
        let body = json!({
            "model": self.model,
            "messages": Self::message_payload(messages),
            "tools": tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect::<Vec<_>>(),
            "tool_choice": "auto",
        });
        let payload = self.post_chat(body).await?;
        Self::parse_message(&payload)
    }
}
