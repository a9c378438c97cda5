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

//! The two tools of the conversation loop: `search` and `submit_answer`.
//!
//! Search results are formatted under a strict budget: a fixed share of the
//! model's context window. Records are appended whole or dropped whole,
//! never truncated mid-record.

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use weft_inference::ToolDefinition;
use weft_query::{SearchPlan, SearchResult};

use crate::planner::search_plan_schema;
use crate::response::{Answer, Citation};
use crate::SearchError;

/// Share of the context window one tool result may occupy.
const MAX_TOOL_RESULT_CONTEXT_SHARE: f64 = 0.3;

/// Cheap chars-per-token estimate for the result budget.
const CHARS_PER_TOKEN: usize = 4;

pub fn search_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "search".to_string(),
        description: "Search the collection for relevant entities. Use different retrieval \
                      strategies (semantic, keyword, hybrid) and filters to refine results."
            .to_string(),
        parameters: search_plan_schema(),
    }
}

pub fn submit_answer_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "submit_answer".to_string(),
        description: "Submit the final answer with citations. Call this when you have enough \
                      information, or when further searching would not improve the answer. If \
                      you could NOT find a direct answer, include a consolidation_search plan \
                      to surface the most relevant results you saw."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The answer text. Clear and well-structured.",
                },
                "citations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "entity_id": { "type": "string" },
                            "quote": { "type": ["string", "null"] },
                        },
                        "required": ["entity_id"],
                    },
                },
                "consolidation_search": {
                    "anyOf": [search_plan_schema(), { "type": "null" }],
                    "description": "Only when no direct answer was found: a final plan that \
                                    re-retrieves the best results seen during the conversation.",
                },
            },
            "required": ["text", "citations"],
        }),
    }
}

#[derive(Deserialize)]
struct SubmitAnswerPayload {
    text: String,
    #[serde(default)]
    citations: Vec<Citation>,
    #[serde(default)]
    consolidation_search: Option<SearchPlan>,
}

/// Parses `submit_answer` arguments into the answer and the optional
/// consolidation plan.
pub fn parse_submit_answer(
    arguments: &JsonValue,
) -> Result<(Answer, Option<SearchPlan>), SearchError> {
    let payload: SubmitAnswerPayload = serde_json::from_value(arguments.clone())
        .map_err(|error| SearchError::InvalidPlan(format!("malformed submit_answer: {error}")))?;
    Ok((
        Answer {
            text: payload.text,
            citations: payload.citations,
        },
        payload.consolidation_search,
    ))
}

/// Formats results for the tool response, by relevance, under the context
/// budget. Whole records only.
pub fn format_results_for_tool_response(
    results: &[SearchResult],
    context_window_tokens: usize,
) -> String {
    if results.is_empty() {
        return "No results found.".to_string();
    }
    let max_chars =
        (context_window_tokens as f64 * MAX_TOOL_RESULT_CONTEXT_SHARE) as usize * CHARS_PER_TOKEN;

    let mut parts: Vec<String> = Vec::new();
    let mut chars_used = 0usize;
    for result in results {
        let result_md = result.to_markdown();
        if chars_used + result_md.len() > max_chars && !parts.is_empty() {
            break;
        }
        chars_used += result_md.len();
        parts.push(result_md);
    }

    let total = results.len();
    let shown = parts.len();
    let header = format!("**{shown} of {total} results** (by relevance):\n\n");
    let footer = if shown < total {
        format!("\n\n*(Showing top {shown} of {total} results)*")
    } else {
        String::new()
    };
    format!("{header}{}{footer}", parts.join("\n\n---\n\n"))
}
