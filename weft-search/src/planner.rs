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

use serde_json::{json, Value as JsonValue};
use tracing::debug;

use weft_inference::StructuredOutputClient;
use weft_query::SearchPlan;

use crate::context::{PLANNER_TASK, WEFT_BACKGROUND};
use crate::state::SearchState;
use crate::SearchError;

/// JSON schema of the plan the planner must return. Shared with the
/// `search` tool definition.
pub(crate) fn search_plan_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "object",
                "properties": {
                    "primary": {
                        "type": "string",
                        "description": "Primary query, used for both dense and BM25 retrieval. Keyword-optimized.",
                    },
                    "variations": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Paraphrases for semantic retrieval only.",
                    },
                },
                "required": ["primary"],
            },
            "retrieval_strategy": {
                "type": "string",
                "enum": ["semantic", "keyword", "hybrid"],
            },
            "limit": { "type": "integer", "minimum": 1, "maximum": 200 },
            "offset": { "type": "integer", "minimum": 0 },
            "filter_groups": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "conditions": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "field": { "type": "string" },
                                    "operator": {
                                        "type": "string",
                                        "enum": ["eq", "ne", "gt", "lt", "ge", "le", "contains", "in", "not_in"],
                                    },
                                    "value": {},
                                },
                                "required": ["field", "operator", "value"],
                            },
                        },
                    },
                    "required": ["conditions"],
                },
            },
            "reasoning": { "type": "string" },
        },
        "required": ["query", "retrieval_strategy", "limit"],
    })
}

/// Proposes the next search plan from the query, the collection summary and
/// the compact history of previous iterations.
pub struct Planner {
    client: StructuredOutputClient,
}

impl Planner {
    pub fn new(client: StructuredOutputClient) -> Self {
        Self { client }
    }

    pub async fn plan(&self, state: &SearchState) -> Result<SearchPlan, SearchError> {
        let prompt = self.build_prompt(state);
        debug!(iteration = state.iteration, "planner-call");
        let plan: SearchPlan = self
            .client
            .structured(&prompt, "search_plan", &search_plan_schema())
            .await?;
        if plan.query.primary.trim().is_empty() {
            return Err(SearchError::InvalidPlan("empty primary query".to_string()));
        }
        debug!(
            iteration = state.iteration,
            num_variations = plan.query.variations.len(),
            num_filter_groups = plan.filter_groups.len(),
            strategy = plan.retrieval_strategy.as_str(),
            "planner-produced-plan"
        );
        Ok(plan)
    }

    fn build_prompt(&self, state: &SearchState) -> String {
        format!(
            "# Background\n\n{WEFT_BACKGROUND}\n\n---\n\n{PLANNER_TASK}\n\n---\n\n\
             # Collection Information\n\n{}\n\n---\n\n\
             # Original User Query\n\n{}\n\n---\n\n\
             # Search History\n\n{}\n",
            state
                .collection_info
                .as_deref()
                .unwrap_or("(Collection info not available)"),
            state.original_query,
            state.history_markdown(),
        )
    }
}
