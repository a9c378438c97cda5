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

use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use crate::filter_translator::FilterTranslator;
use crate::plan::{QueryEmbeddings, SearchPlan};
use crate::{CompiledQuery, CompiledSpec};

/// Target hits per retrieval operator.
pub const TARGET_HITS: usize = 100;

/// Extra HNSW candidates explored per nearest-neighbor operator.
const HNSW_EXPLORE_ADDITIONAL: usize = 100;

/// Floor for the global-phase rerank count.
const DEFAULT_GLOBAL_PHASE_RERANK_COUNT: usize = 100;

/// Index sources queried.
const SCHEMA_SOURCES: &str = "chunk";

/// Compiles a [`SearchPlan`] plus embeddings into a [`CompiledQuery`].
///
/// The WHERE clause has three parts, AND-ed together: the tenant filter on
/// `collection_id`, the retrieval clause (nearest-neighbor per dense query,
/// BM25 `userInput`, or both), and the translated user filters. When caller
/// principals are present an access clause is AND-ed in as well.
#[derive(Default)]
pub struct QueryBuilder {
    filter_translator: FilterTranslator,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self {
            filter_translator: FilterTranslator::new(),
        }
    }

    pub fn build(
        &self,
        plan: &SearchPlan,
        embeddings: &QueryEmbeddings,
        collection_id: Uuid,
        principals: &[String],
    ) -> CompiledQuery {
        let yql = self.build_yql(plan, embeddings, collection_id, principals);
        let params = self.build_params(plan, embeddings);
        debug!(
            yql_chars = yql.len(),
            num_params = params.len(),
            strategy = plan.retrieval_strategy.as_str(),
            "compiled-query"
        );
        CompiledQuery {
            yql,
            params,
            spec: CompiledSpec {
                collection_id,
                strategy: plan.retrieval_strategy,
                primary_query: plan.query.primary.clone(),
                num_dense_queries: embeddings.dense.len(),
                limit: plan.limit,
                offset: plan.offset,
                filter_groups: plan.filter_groups.clone(),
                principals: principals.to_vec(),
            },
        }
    }

    fn build_yql(
        &self,
        plan: &SearchPlan,
        embeddings: &QueryEmbeddings,
        collection_id: Uuid,
        principals: &[String],
    ) -> String {
        let retrieval_clause = self.build_retrieval_clause(plan, embeddings);
        let mut where_parts = vec![
            format!("weft_system_metadata_collection_id contains '{collection_id}'"),
            format!("({retrieval_clause})"),
        ];
        if let Some(access_clause) = build_access_clause(principals) {
            where_parts.push(format!("({access_clause})"));
        }
        if let Some(filter_yql) = self.filter_translator.translate(&plan.filter_groups) {
            where_parts.push(format!("({filter_yql})"));
        }
        format!(
            "select * from sources {SCHEMA_SOURCES} where {}",
            where_parts.join(" AND ")
        )
    }

    fn build_retrieval_clause(&self, plan: &SearchPlan, embeddings: &QueryEmbeddings) -> String {
        let nn_clause = (0..embeddings.dense.len())
            .map(|i| {
                format!(
                    "({{label:\"q{i}\", targetHits:{TARGET_HITS}, \
                     \"hnsw.exploreAdditionalHits\":{HNSW_EXPLORE_ADDITIONAL}}}\
                     nearestNeighbor(dense_embedding, q{i}))"
                )
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        let bm25_clause = format!("{{targetHits:{TARGET_HITS}}}userInput(@query)");
        match plan.retrieval_strategy {
            crate::RetrievalStrategy::Semantic => nn_clause,
            crate::RetrievalStrategy::Keyword => bm25_clause,
            crate::RetrievalStrategy::Hybrid => format!("({bm25_clause}) OR {nn_clause}"),
        }
    }

    fn build_params(
        &self,
        plan: &SearchPlan,
        embeddings: &QueryEmbeddings,
    ) -> Map<String, JsonValue> {
        // Rerank depth must cover pagination.
        let effective_rerank = plan.limit + plan.offset;
        let global_phase_rerank = DEFAULT_GLOBAL_PHASE_RERANK_COUNT.max(effective_rerank);

        let mut params = Map::new();
        params.insert("query".to_string(), json!(plan.query.primary));
        params.insert(
            "ranking.profile".to_string(),
            json!(plan.retrieval_strategy.ranking_profile()),
        );
        params.insert("hits".to_string(), json!(plan.limit));
        params.insert("offset".to_string(), json!(plan.offset));
        params.insert("presentation.summary".to_string(), json!("full"));
        params.insert("ranking.softtimeout.enable".to_string(), json!("false"));
        params.insert(
            "ranking.globalPhase.rerankCount".to_string(),
            json!(global_phase_rerank),
        );

        if let Some(primary_embedding) = embeddings.dense.first() {
            params.insert(
                "ranking.features.query(query_embedding)".to_string(),
                json!({ "values": primary_embedding }),
            );
            for (i, dense) in embeddings.dense.iter().enumerate() {
                params.insert(format!("input.query(q{i})"), json!({ "values": dense }));
            }
        }

        if plan.retrieval_strategy.uses_sparse() {
            if let Some(sparse) = &embeddings.sparse {
                if !sparse.is_empty() {
                    let mut cells = Map::new();
                    for (index, value) in sparse.indices.iter().zip(sparse.values.iter()) {
                        cells.insert(index.to_string(), json!(value));
                    }
                    params.insert("input.query(q_sparse)".to_string(), json!({ "cells": cells }));
                }
            }
        }

        params
    }
}

fn build_access_clause(principals: &[String]) -> Option<String> {
    if principals.is_empty() {
        return None;
    }
    let mut parts = vec!["access_is_public = true".to_string()];
    for principal in principals {
        parts.push(format!(
            "access_viewers contains \"{}\"",
            principal.replace('\\', "\\\\").replace('"', "\\\"")
        ));
    }
    Some(parts.join(" OR "))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::plan::{FilterCondition, FilterGroup, FilterOperator, RetrievalStrategy, SearchQuery};

    fn hybrid_plan() -> SearchPlan {
        SearchPlan {
            query: SearchQuery {
                primary: "Who owns the worn football jersey?".to_string(),
                variations: vec!["football jersey owner".to_string()],
            },
            retrieval_strategy: RetrievalStrategy::Hybrid,
            limit: 10,
            offset: 0,
            filter_groups: Vec::new(),
            reasoning: String::new(),
        }
    }

    fn embeddings(num_dense: usize) -> QueryEmbeddings {
        QueryEmbeddings {
            dense: (0..num_dense).map(|i| vec![i as f32, 1.0]).collect(),
            sparse: Some(weft_entities::SparseWeights {
                indices: vec![7, 13],
                values: vec![0.5, 1.5],
            }),
        }
    }

    #[test]
    fn test_hybrid_yql_has_bm25_and_one_nn_per_dense_query() {
        let builder = QueryBuilder::new();
        let collection_id = Uuid::new_v4();
        let compiled = builder.build(&hybrid_plan(), &embeddings(2), collection_id, &[]);
        assert!(compiled.yql.contains("userInput(@query)"));
        assert_eq!(compiled.yql.matches("nearestNeighbor(dense_embedding").count(), 2);
        assert!(compiled
            .yql
            .contains(&format!("weft_system_metadata_collection_id contains '{collection_id}'")));
    }

    #[test]
    fn test_keyword_yql_has_no_nearest_neighbor() {
        let builder = QueryBuilder::new();
        let mut plan = hybrid_plan();
        plan.retrieval_strategy = RetrievalStrategy::Keyword;
        let compiled = builder.build(&plan, &QueryEmbeddings::default(), Uuid::new_v4(), &[]);
        assert!(compiled.yql.contains("userInput(@query)"));
        assert!(!compiled.yql.contains("nearestNeighbor"));
        assert_eq!(compiled.params["ranking.profile"], json!("keyword-only"));
    }

    #[test]
    fn test_rerank_count_covers_pagination() {
        let builder = QueryBuilder::new();
        let mut plan = hybrid_plan();
        plan.limit = 150;
        plan.offset = 30;
        let compiled = builder.build(&plan, &embeddings(1), Uuid::new_v4(), &[]);
        assert_eq!(compiled.params["ranking.globalPhase.rerankCount"], json!(180));

        plan.limit = 10;
        plan.offset = 0;
        let compiled = builder.build(&plan, &embeddings(1), Uuid::new_v4(), &[]);
        assert_eq!(compiled.params["ranking.globalPhase.rerankCount"], json!(100));
    }

    #[test]
    fn test_sparse_tensor_cells_keyed_by_index() {
        let builder = QueryBuilder::new();
        let compiled = builder.build(&hybrid_plan(), &embeddings(1), Uuid::new_v4(), &[]);
        let cells = &compiled.params["input.query(q_sparse)"]["cells"];
        assert_eq!(cells["7"], json!(0.5));
        assert_eq!(cells["13"], json!(1.5));
    }

    #[test]
    fn test_semantic_strategy_omits_sparse_tensor() {
        let builder = QueryBuilder::new();
        let mut plan = hybrid_plan();
        plan.retrieval_strategy = RetrievalStrategy::Semantic;
        let compiled = builder.build(&plan, &embeddings(1), Uuid::new_v4(), &[]);
        assert!(!compiled.params.contains_key("input.query(q_sparse)"));
        assert_eq!(compiled.params["ranking.profile"], json!("semantic-only"));
    }

    #[test]
    fn test_access_clause_added_for_principals() {
        let builder = QueryBuilder::new();
        let principals = vec!["user:alice".to_string(), "group:devs".to_string()];
        let compiled = builder.build(&hybrid_plan(), &embeddings(1), Uuid::new_v4(), &principals);
        assert!(compiled.yql.contains(
            "(access_is_public = true OR access_viewers contains \"user:alice\" \
             OR access_viewers contains \"group:devs\")"
        ));
    }

    #[test]
    fn test_user_filters_are_anded_into_where() {
        let builder = QueryBuilder::new();
        let mut plan = hybrid_plan();
        plan.filter_groups = vec![FilterGroup {
            conditions: vec![FilterCondition {
                field: "source_name".to_string(),
                operator: FilterOperator::Eq,
                value: json!("slack"),
            }],
        }];
        let compiled = builder.build(&plan, &embeddings(1), Uuid::new_v4(), &[]);
        assert!(compiled
            .yql
            .contains("AND ((weft_system_metadata_source_name contains \"slack\"))"));
    }

    #[test]
    fn test_params_logging_elides_embeddings() {
        let builder = QueryBuilder::new();
        let compiled = builder.build(&hybrid_plan(), &embeddings(1), Uuid::new_v4(), &[]);
        let formatted = compiled.format_params_for_logging();
        assert!(formatted.contains("input.query(q0): <embedding>"));
        assert!(!formatted.contains("\"values\""));
    }
}
