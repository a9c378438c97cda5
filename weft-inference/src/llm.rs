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

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use weft_common::retry::{ClassifyError, ErrorClass};

use crate::InferenceError;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    None,
    Low,
    #[default]
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::None => "none",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: JsonValue,
}

/// Tool made available to the model, OpenAI function format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// For `Tool` role messages: which call this message answers.
    #[serde(default)]
    pub tool_call_id: Option<String>,
    /// For `Assistant` role messages that requested tool calls.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// One assistant turn: thinking (reasoning content), plain content, and any
/// tool calls, parsed from distinct content blocks.
#[derive(Clone, Debug, Default)]
pub struct ChatOutput {
    pub thinking: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// A single LLM provider.
#[cfg_attr(any(test, feature = "testsuite"), mockall::automock)]
#[async_trait]
pub trait LlmClient: Send + Sync + 'static {
    fn provider_name(&self) -> String;

    fn context_window_tokens(&self) -> usize;

    /// Asks the model for a JSON document conforming to `schema`.
    async fn structured_output(
        &self,
        prompt: &str,
        schema_name: &str,
        schema: &JsonValue,
    ) -> Result<JsonValue, InferenceError>;

    /// One conversation turn with tool calling.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatOutput, InferenceError>;
}

/// Providers in preference order; retryable failures fall through to the
/// next provider, permanent failures propagate immediately.
#[derive(Clone)]
pub struct StructuredOutputClient {
    providers: Vec<Arc<dyn LlmClient>>,
}

impl StructuredOutputClient {
    pub fn new(providers: Vec<Arc<dyn LlmClient>>) -> Result<Self, InferenceError> {
        if providers.is_empty() {
            return Err(InferenceError::Configuration(
                "at least one LLM provider is required".to_string(),
            ));
        }
        Ok(Self { providers })
    }

    pub fn primary(&self) -> &Arc<dyn LlmClient> {
        &self.providers[0]
    }

    pub async fn structured<T: DeserializeOwned>(
        &self,
        prompt: &str,
        schema_name: &str,
        schema: &JsonValue,
    ) -> Result<T, InferenceError> {
        let mut last_error: Option<InferenceError> = None;
        for (i, provider) in self.providers.iter().enumerate() {
            debug!(
                provider = %provider.provider_name(),
                attempt = i + 1,
                total = self.providers.len(),
                "structured-output-call"
            );
            match provider.structured_output(prompt, schema_name, schema).await {
                Ok(value) => {
                    return serde_json::from_value(value).map_err(|error| {
                        InferenceError::InvalidResponse(format!(
                            "{schema_name} does not match schema: {error}"
                        ))
                    });
                }
                Err(error) if error.error_class() == ErrorClass::Retryable => {
                    warn!(
                        provider = %provider.provider_name(),
                        %error,
                        "provider failed, trying next"
                    );
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(InferenceError::AllProvidersFailed {
            attempted: self.providers.len(),
            last_error: last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no providers".to_string()),
        })
    }
}
