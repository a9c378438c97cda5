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

use uuid::Uuid;

use weft_query::{CompiledQuery, QueryEmbeddings, SearchPlan, SearchResult};

use crate::judge::Judgement;

/// Iteration bound of the loop.
pub const MAX_ITERATIONS: usize = 3;

/// Everything one iteration produced.
#[derive(Debug, Default)]
pub struct IterationRecord {
    pub plan: Option<SearchPlan>,
    pub embeddings: Option<QueryEmbeddings>,
    pub query: Option<CompiledQuery>,
    pub results: Option<Vec<SearchResult>>,
    pub judgement: Option<Judgement>,
    pub error: Option<String>,
}

/// Mutable state of one agentic search.
#[derive(Debug)]
pub struct SearchState {
    pub original_query: String,
    pub collection_id: Uuid,
    pub principals: Vec<String>,
    pub iteration: usize,
    pub iterations: Vec<IterationRecord>,
    /// Collection summary markdown, computed once on the first iteration.
    pub collection_info: Option<String>,
    pub final_results: Option<Vec<SearchResult>>,
}

impl SearchState {
    pub fn new(
        original_query: impl Into<String>,
        collection_id: Uuid,
        principals: Vec<String>,
        max_iterations: usize,
    ) -> Self {
        let mut iterations = Vec::with_capacity(max_iterations);
        iterations.push(IterationRecord::default());
        Self {
            original_query: original_query.into(),
            collection_id,
            principals,
            iteration: 0,
            iterations,
            collection_info: None,
            final_results: None,
        }
    }

    pub fn is_first_iteration(&self) -> bool {
        self.iteration == 0
    }

    pub fn current(&self) -> &IterationRecord {
        &self.iterations[self.iteration]
    }

    pub fn current_mut(&mut self) -> &mut IterationRecord {
        &mut self.iterations[self.iteration]
    }

    pub fn advance(&mut self) {
        self.iteration += 1;
        self.iterations.push(IterationRecord::default());
    }

    pub fn latest_judgement(&self) -> Option<&Judgement> {
        self.iterations
            .iter()
            .rev()
            .find_map(|record| record.judgement.as_ref())
    }

    /// Compact markdown history of iterations before the current one, fed
    /// back to the planner and the judge.
    pub fn history_markdown(&self) -> String {
        if self.is_first_iteration() {
            return "(No previous iterations)".to_string();
        }
        let mut lines: Vec<String> = Vec::new();
        for (i, record) in self.iterations[..self.iteration].iter().enumerate() {
            lines.push(format!("### Iteration {}", i + 1));
            lines.push(String::new());
            if let Some(plan) = &record.plan {
                lines.push("**Plan:**".to_string());
                lines.push(plan.to_markdown());
                lines.push(String::new());
            }
            if let Some(query) = &record.query {
                lines.push("**Compiled query:**".to_string());
                lines.push(format!("```yql\n{}\n```", query.yql));
                lines.push(String::new());
            }
            if let Some(error) = &record.error {
                lines.push("**Error:**".to_string());
                lines.push(format!("```\n{error}\n```"));
                lines.push(String::new());
            }
            if let Some(results) = &record.results {
                lines.push(format!("**Results:** {} documents returned", results.len()));
                lines.push(String::new());
            }
            if let Some(judgement) = &record.judgement {
                lines.push("**Judge evaluation:**".to_string());
                lines.push(judgement.to_markdown());
                lines.push(String::new());
            }
            lines.push("---".to_string());
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use weft_query::{RetrievalStrategy, SearchQuery};

    use super::*;

    #[test]
    fn test_new_state_starts_at_first_iteration() {
        let state = SearchState::new("q", Uuid::new_v4(), Vec::new(), MAX_ITERATIONS);
        assert!(state.is_first_iteration());
        assert_eq!(state.history_markdown(), "(No previous iterations)");
        assert!(state.latest_judgement().is_none());
    }

    #[test]
    fn test_history_includes_prior_iterations_only() {
        let mut state = SearchState::new("q", Uuid::new_v4(), Vec::new(), MAX_ITERATIONS);
        state.current_mut().plan = Some(SearchPlan {
            query: SearchQuery::new("first query"),
            retrieval_strategy: RetrievalStrategy::Hybrid,
            limit: 10,
            offset: 0,
            filter_groups: Vec::new(),
            reasoning: "start broad".to_string(),
        });
        state.current_mut().error = Some("timeout".to_string());
        state.advance();
        state.current_mut().plan = Some(SearchPlan {
            query: SearchQuery::new("second query"),
            retrieval_strategy: RetrievalStrategy::Keyword,
            limit: 10,
            offset: 0,
            filter_groups: Vec::new(),
            reasoning: String::new(),
        });

        let history = state.history_markdown();
        assert!(history.contains("### Iteration 1"));
        assert!(history.contains("first query"));
        assert!(history.contains("timeout"));
        // The current iteration is presented separately, not in history.
        assert!(!history.contains("second query"));
    }
}
