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
use serde_json::Value as JsonValue;

use weft_entities::SparseWeights;

/// How results are retrieved.
///
/// `semantic` returns conceptually similar chunks even without exact term
/// matches. `keyword` returns only chunks containing the query terms.
/// `hybrid` combines both with reciprocal-rank fusion.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    Semantic,
    Keyword,
    Hybrid,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Semantic => "semantic",
            RetrievalStrategy::Keyword => "keyword",
            RetrievalStrategy::Hybrid => "hybrid",
        }
    }

    /// Ranking profile names are part of the destination contract.
    pub fn ranking_profile(&self) -> &'static str {
        match self {
            RetrievalStrategy::Semantic => "semantic-only",
            RetrievalStrategy::Keyword => "keyword-only",
            RetrievalStrategy::Hybrid => "hybrid-rrf",
        }
    }

    pub fn uses_dense(&self) -> bool {
        matches!(self, RetrievalStrategy::Semantic | RetrievalStrategy::Hybrid)
    }

    pub fn uses_sparse(&self) -> bool {
        matches!(self, RetrievalStrategy::Keyword | RetrievalStrategy::Hybrid)
    }
}

/// The primary query plus semantic-only variations.
///
/// The primary is used for both dense and BM25 retrieval and should be
/// keyword-optimized; variations are paraphrases for dense retrieval only.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub primary: String,
    #[serde(default)]
    pub variations: Vec<String>,
}

impl SearchQuery {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            variations: Vec::new(),
        }
    }

    /// Primary first, then variations: the embedding order the builder
    /// assumes when labeling nearest-neighbor operators.
    pub fn texts(&self) -> Vec<String> {
        let mut texts = vec![self.primary.clone()];
        texts.extend(self.variations.iter().cloned());
        texts
    }
}

/// Closed operator set for plan filters.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    In,
    NotIn,
}

/// One `(field, operator, value)` predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    pub value: JsonValue,
}

/// Conditions combined with AND. Groups are combined with OR, so the filter
/// language expresses `(A AND B) OR (C AND D)`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub conditions: Vec<FilterCondition>,
}

/// The planner's output for one iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchPlan {
    pub query: SearchQuery,
    pub retrieval_strategy: RetrievalStrategy,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub filter_groups: Vec<FilterGroup>,
    #[serde(default)]
    pub reasoning: String,
}

impl SearchPlan {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            format!("- **Query:** `{}`", self.query.primary),
            format!("- **Strategy:** {}", self.retrieval_strategy.as_str()),
            format!("- **Limit:** {}, **Offset:** {}", self.limit, self.offset),
        ];
        if !self.query.variations.is_empty() {
            let variations = self
                .query
                .variations
                .iter()
                .map(|variation| format!("`{variation}`"))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("- **Variations:** {variations}"));
        }
        if !self.filter_groups.is_empty() {
            lines.push(format!("- **Filter groups:** {}", self.filter_groups.len()));
            for (i, group) in self.filter_groups.iter().enumerate() {
                let conditions = group
                    .conditions
                    .iter()
                    .map(|condition| {
                        format!(
                            "{} {:?} {}",
                            condition.field, condition.operator, condition.value
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                lines.push(format!("  - Group {}: {conditions}", i + 1));
            }
        }
        if !self.reasoning.is_empty() {
            lines.push(format!("- **Reasoning:** {}", self.reasoning));
        }
        lines.join("\n")
    }
}

/// Embeddings computed for one plan: dense per query text (primary first),
/// sparse for the primary query only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryEmbeddings {
    pub dense: Vec<Vec<f32>>,
    pub sparse: Option<SparseWeights>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_ranking_profiles_are_contractual() {
        assert_eq!(RetrievalStrategy::Semantic.ranking_profile(), "semantic-only");
        assert_eq!(RetrievalStrategy::Keyword.ranking_profile(), "keyword-only");
        assert_eq!(RetrievalStrategy::Hybrid.ranking_profile(), "hybrid-rrf");
    }

    #[test]
    fn test_query_texts_keep_primary_first() {
        let query = SearchQuery {
            primary: "football jersey".to_string(),
            variations: vec!["worn jersey owner".to_string()],
        };
        assert_eq!(query.texts(), vec!["football jersey", "worn jersey owner"]);
    }

    #[test]
    fn test_plan_serde_uses_snake_case_operators() {
        let plan = SearchPlan {
            query: SearchQuery::new("q"),
            retrieval_strategy: RetrievalStrategy::Hybrid,
            limit: 10,
            offset: 0,
            filter_groups: vec![FilterGroup {
                conditions: vec![FilterCondition {
                    field: "entity_type".to_string(),
                    operator: FilterOperator::NotIn,
                    value: serde_json::json!(["slack.channel"]),
                }],
            }],
            reasoning: String::new(),
        };
        let json = serde_json::to_string(&plan).unwrap();
        assert!(json.contains("\"not_in\""));
        assert!(json.contains("\"hybrid\""));
        let back: SearchPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.filter_groups, plan.filter_groups);
    }
}
