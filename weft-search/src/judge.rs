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

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use weft_inference::StructuredOutputClient;
use weft_query::SearchResult;

use crate::context::{JUDGE_TASK, WEFT_BACKGROUND};
use crate::state::SearchState;
use crate::SearchError;

/// The judge's verdict on one iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Judgement {
    pub should_continue: bool,
    pub reasoning: String,
    #[serde(default)]
    pub useful_result_ids: Vec<String>,
    #[serde(default)]
    pub advice: Option<String>,
    #[serde(default)]
    pub answer_snippet: Option<String>,
    #[serde(default)]
    pub error_analysis: Option<String>,
}

impl Judgement {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            format!("- **Should continue:** {}", self.should_continue),
            format!("- **Reasoning:** {}", self.reasoning),
        ];
        if !self.useful_result_ids.is_empty() {
            lines.push(format!(
                "- **Useful results:** {}",
                self.useful_result_ids.join(", ")
            ));
        }
        if let Some(advice) = &self.advice {
            lines.push(format!("- **Advice:** {advice}"));
        }
        if let Some(error_analysis) = &self.error_analysis {
            lines.push(format!("- **Error analysis:** {error_analysis}"));
        }
        lines.join("\n")
    }
}

fn judgement_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "should_continue": { "type": "boolean" },
            "reasoning": { "type": "string" },
            "useful_result_ids": {
                "type": "array",
                "items": { "type": "string" },
                "description": "original_entity_id values of results worth returning.",
            },
            "advice": { "type": ["string", "null"] },
            "answer_snippet": { "type": ["string", "null"] },
            "error_analysis": { "type": ["string", "null"] },
        },
        "required": ["should_continue", "reasoning"],
    })
}

/// Decides whether the results suffice or another iteration is needed.
pub struct Judge {
    client: StructuredOutputClient,
}

impl Judge {
    pub fn new(client: StructuredOutputClient) -> Self {
        Self { client }
    }

    pub async fn judge(&self, state: &SearchState) -> Result<Judgement, SearchError> {
        let prompt = self.build_prompt(state);
        debug!(iteration = state.iteration, "judge-call");
        let judgement: Judgement = self
            .client
            .structured(&prompt, "judgement", &judgement_schema())
            .await?;
        info!(
            iteration = state.iteration,
            should_continue = judgement.should_continue,
            num_useful = judgement.useful_result_ids.len(),
            "judge-verdict"
        );
        Ok(judgement)
    }

    fn build_prompt(&self, state: &SearchState) -> String {
        let current = state.current();
        let plan_md = current
            .plan
            .as_ref()
            .map(|plan| plan.to_markdown())
            .unwrap_or_else(|| "(No plan)".to_string());
        let query_md = current
            .query
            .as_ref()
            .map(|query| {
                format!(
                    "```yql\n{}\n```\n\n**Params:**\n```\n{}\n```",
                    query.yql,
                    query.format_params_for_logging()
                )
            })
            .unwrap_or_else(|| "(No query executed)".to_string());
        let results_md = match &current.results {
            Some(results) if !results.is_empty() => format_results_markdown(results),
            Some(_) => "No results found.".to_string(),
            None => "(No results)".to_string(),
        };
        let error_md = current
            .error
            .as_ref()
            .map(|error| format!("```\n{error}\n```"))
            .unwrap_or_else(|| "(No error)".to_string());

        format!(
            "# Background\n\n{WEFT_BACKGROUND}\n\n---\n\n{JUDGE_TASK}\n\n---\n\n\
             # Collection Information\n\n{}\n\n---\n\n\
             # Original User Query\n\n{}\n\n---\n\n\
             # Current Iteration ({})\n\n\
             ## Plan Used\n\n{plan_md}\n\n\
             ## Query Executed\n\n{query_md}\n\n\
             ## Results\n\n{results_md}\n\n\
             ## Error (if any)\n\n{error_md}\n\n---\n\n\
             # Search History\n\n{}\n",
            state
                .collection_info
                .as_deref()
                .unwrap_or("(Collection info not available)"),
            state.original_query,
            state.iteration + 1,
            state.history_markdown(),
        )
    }
}

fn format_results_markdown(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|result| result.to_markdown())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use weft_inference::MockLlmClient;

    #[tokio::test]
    async fn test_judge_parses_verdict() {
        let mut provider = MockLlmClient::new();
        provider.expect_provider_name().return_const("mock".to_string());
        provider.expect_structured_output().returning(|_, name, _| {
            assert_eq!(name, "judgement");
            Ok(json!({
                "should_continue": false,
                "reasoning": "the first result answers the question",
                "useful_result_ids": ["E1"],
                "answer_snippet": "The jersey belongs to Sam.",
            }))
        });
        let judge = Judge::new(StructuredOutputClient::new(vec![Arc::new(provider)]).unwrap());
        let state = SearchState::new("q", Uuid::new_v4(), Vec::new(), 3);
        let judgement = judge.judge(&state).await.unwrap();
        assert!(!judgement.should_continue);
        assert_eq!(judgement.useful_result_ids, vec!["E1"]);
        assert_eq!(judgement.answer_snippet.as_deref(), Some("The jersey belongs to Sam."));
        assert!(judgement.error_analysis.is_none());
    }

    #[test]
    fn test_judgement_markdown() {
        let judgement = Judgement {
            should_continue: true,
            reasoning: "nothing relevant yet".to_string(),
            useful_result_ids: Vec::new(),
            advice: Some("try a keyword search for the exact phrase".to_string()),
            answer_snippet: None,
            error_analysis: None,
        };
        let markdown = judgement.to_markdown();
        assert!(markdown.contains("Should continue:** true"));
        assert!(markdown.contains("Advice"));
    }
}
