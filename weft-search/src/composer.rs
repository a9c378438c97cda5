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

//! Tool-calling composer: the conversational variant of the search loop.
//!
//! The model drives the iteration itself through `search` and
//! `submit_answer` tool calls. Reasoning content streams as `thinking`
//! events, tool executions as `searching` events, and `submit_answer`
//! terminates the conversation with a `done` event.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use weft_inference::{ChatMessage, LlmClient, ToolCall};
use weft_query::{QueryBuilder, SearchPlan, SearchResult};

use crate::context::{COMPOSER_TASK, WEFT_BACKGROUND};
use crate::embedder::QueryEmbedder;
use crate::events::{EventEmitter, SearchEvent};
use crate::executor::Executor;
use crate::response::{Answer, SearchResponse};
use crate::tools::{
    format_results_for_tool_response, parse_submit_answer, search_tool_definition,
    submit_answer_tool_definition,
};
use crate::{SearchError, SearchRequest};

/// Upper bound on conversation turns before the composer gives up.
pub const MAX_TOOL_TURNS: usize = 8;

pub struct ToolCallComposer {
    client: Arc<dyn LlmClient>,
    embedder: QueryEmbedder,
    builder: QueryBuilder,
    executor: Executor,
    max_turns: usize,
}

impl ToolCallComposer {
    pub fn new(client: Arc<dyn LlmClient>, embedder: QueryEmbedder, executor: Executor) -> Self {
        Self {
            client,
            embedder,
            builder: QueryBuilder::new(),
            executor,
            max_turns: MAX_TOOL_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub async fn run(
        &self,
        request: SearchRequest,
        emitter: &EventEmitter,
    ) -> Result<SearchResponse, SearchError> {
        let tools = [search_tool_definition(), submit_answer_tool_definition()];
        let mut messages = vec![
            ChatMessage::system(format!("{WEFT_BACKGROUND}\n\n{COMPOSER_TASK}")),
            ChatMessage::user(request.query.clone()),
        ];
        // Best results seen across the whole conversation, by doc id.
        let mut seen_results: HashMap<String, SearchResult> = HashMap::new();

        for turn in 0..self.max_turns {
            let output = match self.client.chat(&messages, &tools).await {
                Ok(output) => output,
                Err(error) => {
                    emitter.emit(SearchEvent::Error {
                        message: error.to_string(),
                    });
                    return Err(error.into());
                }
            };
            if let Some(thinking) = &output.thinking {
                emitter.emit(SearchEvent::Thinking {
                    iteration: turn,
                    text: thinking.clone(),
                });
            }
            if output.tool_calls.is_empty() {
                debug!(turn, "model produced no tool call, nudging");
                if let Some(content) = &output.content {
                    messages.push(ChatMessage {
                        role: weft_inference::ChatRole::Assistant,
                        content: content.clone(),
                        tool_call_id: None,
                        tool_calls: Vec::new(),
                    });
                }
                messages.push(ChatMessage::user(
                    "Use the `search` tool to gather evidence, or `submit_answer` to finish.",
                ));
                continue;
            }

            messages.push(ChatMessage::assistant_with_tool_calls(
                output.content.clone().unwrap_or_default(),
                output.tool_calls.clone(),
            ));

            for call in output.tool_calls {
                match call.name.as_str() {
                    "search" => {
                        let tool_response = self
                            .run_search_call(&call, &request, turn, &mut seen_results, emitter)
                            .await;
                        messages.push(ChatMessage::tool_result(call.id.clone(), tool_response));
                    }
                    "submit_answer" => {
                        let response = self
                            .finish(&call, &request, &seen_results)
                            .await?;
                        emitter.emit(SearchEvent::Done {
                            response: response.clone(),
                        });
                        return Ok(response);
                    }
                    unknown => {
                        warn!(tool = unknown, "model called unknown tool");
                        messages.push(ChatMessage::tool_result(
                            call.id.clone(),
                            format!("Unknown tool `{unknown}`."),
                        ));
                    }
                }
            }
        }

        // Turn budget exhausted: return the best evidence gathered.
        let mut results: Vec<SearchResult> = seen_results.into_values().collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let response = SearchResponse {
            results,
            answer: Answer {
                text: String::new(),
                citations: Vec::new(),
            },
            answer_found: false,
        };
        emitter.emit(SearchEvent::Done {
            response: response.clone(),
        });
        Ok(response)
    }

    async fn run_search_call(
        &self,
        call: &ToolCall,
        request: &SearchRequest,
        turn: usize,
        seen_results: &mut HashMap<String, SearchResult>,
        emitter: &EventEmitter,
    ) -> String {
        let plan: SearchPlan = match serde_json::from_value(call.arguments.clone()) {
            Ok(plan) => plan,
            Err(error) => {
                return format!("Invalid search plan: {error}. Fix the arguments and retry.")
            }
        };
        match self.execute_plan(&plan, request).await {
            Ok((results, duration_ms)) => {
                emitter.emit(SearchEvent::Searching {
                    iteration: turn,
                    result_count: results.len(),
                    duration_ms,
                });
                for result in &results {
                    seen_results
                        .entry(result.doc_id.clone())
                        .and_modify(|existing| {
                            if result.score > existing.score {
                                *existing = result.clone();
                            }
                        })
                        .or_insert_with(|| result.clone());
                }
                format_results_for_tool_response(&results, self.client.context_window_tokens())
            }
            Err(error) => {
                warn!(%error, "tool search failed");
                format!("Search failed: {error}. Adjust the plan and retry.")
            }
        }
    }

    async fn execute_plan(
        &self,
        plan: &SearchPlan,
        request: &SearchRequest,
    ) -> Result<(Vec<SearchResult>, u64), SearchError> {
        let embeddings = self
            .embedder
            .embed(&plan.query, plan.retrieval_strategy)
            .await?;
        let compiled = self.builder.build(
            plan,
            &embeddings,
            request.collection_id,
            &request.principals,
        );
        self.executor.execute(&compiled).await
    }

    async fn finish(
        &self,
        call: &ToolCall,
        request: &SearchRequest,
        seen_results: &HashMap<String, SearchResult>,
    ) -> Result<SearchResponse, SearchError> {
        let (answer, consolidation_search) = parse_submit_answer(&call.arguments)?;
        let answer_found = consolidation_search.is_none();
        let results = match consolidation_search {
            // No direct answer: one final search designed to re-retrieve the
            // best results seen during the conversation.
            Some(plan) => self.execute_plan(&plan, request).await?.0,
            None => {
                let cited: Vec<SearchResult> = seen_results
                    .values()
                    .filter(|result| {
                        answer
                            .citations
                            .iter()
                            .any(|citation| citation.entity_id == result.original_entity_id)
                    })
                    .cloned()
                    .collect();
                if cited.is_empty() {
                    let mut all: Vec<SearchResult> = seen_results.values().cloned().collect();
                    all.sort_by(|a, b| {
                        b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    all
                } else {
                    cited
                }
            }
        };
        Ok(SearchResponse {
            results,
            answer,
            answer_found,
        })
    }
}
