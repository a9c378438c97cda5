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

//! # Inference clients
//!
//! Dense and sparse embedders for the sync pipeline and the search loop, and
//! a structured-output LLM surface with a provider fallback chain for the
//! planner, judge and tool-calling composer.

mod embed;
mod llm;
mod openai_compat;
mod rate_limit;
mod tokens;

pub use embed::{DenseEmbedder, HashedSparseEmbedder, HttpDenseEmbedder, SparseEmbedder};
#[cfg(any(test, feature = "testsuite"))]
pub use embed::MockDenseEmbedder;
pub use llm::{
    ChatMessage, ChatOutput, ChatRole, LlmClient, ReasoningEffort, StructuredOutputClient,
    ToolCall, ToolDefinition,
};
#[cfg(any(test, feature = "testsuite"))]
pub use llm::MockLlmClient;
pub use openai_compat::OpenAiCompatClient;
pub use rate_limit::ProviderRateLimiter;
pub use tokens::{cl100k_token_count, Tokenizer};

use weft_common::retry::{ClassifyError, ErrorClass};
use weft_common::ErrorSeverity;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("provider rate limit exceeded, retry after {retry_after_secs:.1}s")]
    RateLimited { retry_after_secs: f64 },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider call timed out: {0}")]
    Timeout(String),
    #[error("provider returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("all {attempted} providers failed, last error: {last_error}")]
    AllProvidersFailed { attempted: usize, last_error: String },
    #[error("inference misconfigured: {0}")]
    Configuration(String),
}

impl InferenceError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            InferenceError::RateLimited { .. }
            | InferenceError::Unavailable(_)
            | InferenceError::Timeout(_)
            | InferenceError::AllProvidersFailed { .. } => ErrorSeverity::Operational,
            InferenceError::Rejected { .. } | InferenceError::Configuration(_) => {
                ErrorSeverity::Expected
            }
            InferenceError::InvalidResponse(_) => ErrorSeverity::Critical,
        }
    }
}

impl ClassifyError for InferenceError {
    fn error_class(&self) -> ErrorClass {
        match self {
            InferenceError::RateLimited { .. }
            | InferenceError::Unavailable(_)
            | InferenceError::Timeout(_) => ErrorClass::Retryable,
            _ => ErrorClass::Permanent,
        }
    }
}
