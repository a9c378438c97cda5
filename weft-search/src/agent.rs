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

use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_query::QueryBuilder;

use crate::collection_info::CollectionInfoBuilder;
use crate::embedder::QueryEmbedder;
use crate::events::{EventEmitter, SearchEvent};
use crate::executor::Executor;
use crate::judge::Judge;
use crate::planner::Planner;
use crate::response::{Answer, Citation, SearchResponse};
use crate::state::{SearchState, MAX_ITERATIONS};
use crate::SearchError;

#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub query: String,
    pub collection_id: Uuid,
    /// Caller principals; the builder adds the public-or-viewer access
    /// filter when any are present.
    pub principals: Vec<String>,
}

/// The fixed planner → embedder → builder → executor → judge loop.
pub struct AgenticSearcher {
    planner: Planner,
    judge: Judge,
    embedder: QueryEmbedder,
    builder: QueryBuilder,
    executor: Executor,
    collection_info: CollectionInfoBuilder,
    max_iterations: usize,
}

impl AgenticSearcher {
    pub fn new(
        planner: Planner,
        judge: Judge,
        embedder: QueryEmbedder,
        executor: Executor,
        collection_info: CollectionInfoBuilder,
    ) -> Self {
        Self {
            planner,
            judge,
            embedder,
            builder: QueryBuilder::new(),
            executor,
            collection_info,
            max_iterations: MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub async fn search(
        &self,
        request: SearchRequest,
        emitter: &EventEmitter,
    ) -> Result<SearchState, SearchError> {
        info!(collection_id = %request.collection_id, query = %request.query, "agentic-search-start");
        let mut state = SearchState::new(
            request.query,
            request.collection_id,
            request.principals,
            self.max_iterations,
        );
        match self.run_loop(&mut state, emitter).await {
            Ok(()) => {
                let response = self.build_response(&state);
                emitter.emit(SearchEvent::Done { response });
                Ok(state)
            }
            Err(error) => {
                emitter.emit(SearchEvent::Error {
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn run_loop(
        &self,
        state: &mut SearchState,
        emitter: &EventEmitter,
    ) -> Result<(), SearchError> {
        loop {
            let iteration = state.iteration;
            debug!(iteration, "search-iteration-start");

            // Collection summary: computed once, cached in the state.
            if state.collection_info.is_none() {
                state.collection_info =
                    Some(self.collection_info.build_markdown(state.collection_id).await?);
                if let Ok(summary_line) =
                    self.collection_info.build_summary_line(state.collection_id).await
                {
                    emitter.emit(SearchEvent::Thinking {
                        iteration,
                        text: summary_line,
                    });
                }
            }

            // Plan.
            let plan = self.planner.plan(state).await?;
            emitter.emit(SearchEvent::Thinking {
                iteration,
                text: plan.reasoning.clone(),
            });

            // Embed + build + execute. Failures are recorded on the
            // iteration and judged, not thrown: the judge may steer the
            // planner around a bad filter.
            match self.embed_build_execute(state, &plan).await {
                Ok((result_count, duration_ms)) => {
                    emitter.emit(SearchEvent::Searching {
                        iteration,
                        result_count,
                        duration_ms,
                    });
                }
                Err(error) => {
                    warn!(iteration, %error, "search-execution-failed");
                    state.current_mut().error = Some(error.to_string());
                }
            }
            state.current_mut().plan = Some(plan);

            // Judge.
            let judgement = self.judge.judge(state).await?;
            emitter.emit(SearchEvent::Thinking {
                iteration,
                text: judgement.reasoning.clone(),
            });
            if let Some(advice) = judgement.advice.clone().filter(|_| judgement.should_continue) {
                emitter.emit(SearchEvent::Thinking {
                    iteration,
                    text: advice,
                });
            }
            let should_stop = !judgement.should_continue;
            let useful_result_ids = judgement.useful_result_ids.clone();
            state.current_mut().judgement = Some(judgement);

            if should_stop {
                let current_results = state.current().results.clone().unwrap_or_default();
                let mut final_results: Vec<_> = current_results
                    .iter()
                    .filter(|result| useful_result_ids.contains(&result.original_entity_id))
                    .cloned()
                    .collect();
                if final_results.is_empty() {
                    final_results = current_results;
                }
                state.final_results = Some(final_results);
                info!(iteration, "judge-stopped-search");
                return Ok(());
            }
            if state.iteration + 1 >= self.max_iterations {
                state.final_results = state.current().results.clone();
                info!("max-iterations-reached");
                return Ok(());
            }
            state.advance();
        }
    }

    async fn embed_build_execute(
        &self,
        state: &mut SearchState,
        plan: &weft_query::SearchPlan,
    ) -> Result<(usize, u64), SearchError> {
        let embeddings = self
            .embedder
            .embed(&plan.query, plan.retrieval_strategy)
            .await?;
        let compiled = self.builder.build(
            plan,
            &embeddings,
            state.collection_id,
            &state.principals,
        );
        debug!(yql = %compiled.yql, "compiled-yql");
        state.current_mut().embeddings = Some(embeddings);
        state.current_mut().query = Some(compiled.clone());
        let (results, duration_ms) = self.executor.execute(&compiled).await?;
        let result_count = results.len();
        state.current_mut().results = Some(results);
        Ok((result_count, duration_ms))
    }

    fn build_response(&self, state: &SearchState) -> SearchResponse {
        let results = state.final_results.clone().unwrap_or_default();
        let answer_snippet = state
            .latest_judgement()
            .and_then(|judgement| judgement.answer_snippet.clone());
        let answer_found = answer_snippet.is_some();
        let citations = results
            .iter()
            .map(|result| Citation {
                entity_id: result.original_entity_id.clone(),
                quote: None,
            })
            .collect();
        SearchResponse {
            results,
            answer: Answer {
                text: answer_snippet.unwrap_or_default(),
                citations,
            },
            answer_found,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use weft_destinations::{chunk_doc_id, ChunkDocument, Destination, InMemoryDestination};
    use weft_inference::{
        HashedSparseEmbedder, MockDenseEmbedder, MockLlmClient, StructuredOutputClient,
    };
    use weft_metastore::{EntityHashRecord, InMemoryMetastore, Metastore};

    fn jersey_document(collection_id: Uuid, sync_id: Uuid) -> ChunkDocument {
        ChunkDocument {
            doc_id: chunk_doc_id(sync_id, "jersey-note", 0),
            sync_id,
            collection_id,
            original_entity_id: "jersey-note".to_string(),
            chunk_index: 0,
            name: "jersey note".to_string(),
            entity_type: "notion.page".to_string(),
            source_name: "notion".to_string(),
            content_hash: "h".to_string(),
            text: "The worn football jersey belongs to Sam.".to_string(),
            dense_embedding: Some(vec![1.0, 0.0]),
            sparse_embedding: None,
            breadcrumbs: Vec::new(),
            access: None,
        }
    }

    fn noise_document(collection_id: Uuid, sync_id: Uuid) -> ChunkDocument {
        ChunkDocument {
            doc_id: chunk_doc_id(sync_id, "bread-recipe", 0),
            sync_id,
            collection_id,
            original_entity_id: "bread-recipe".to_string(),
            chunk_index: 0,
            name: "bread recipe".to_string(),
            entity_type: "notion.page".to_string(),
            source_name: "notion".to_string(),
            content_hash: "h2".to_string(),
            text: "Knead the dough and bake at 230C.".to_string(),
            dense_embedding: Some(vec![0.0, 1.0]),
            sparse_embedding: None,
            breadcrumbs: Vec::new(),
            access: None,
        }
    }

    fn structured_client(responses: Vec<serde_json::Value>) -> StructuredOutputClient {
        let mut provider = MockLlmClient::new();
        provider.expect_provider_name().return_const("mock".to_string());
        let responses = std::sync::Mutex::new(responses.into_iter());
        provider.expect_structured_output().returning(move |_, _, _| {
            Ok(responses
                .lock()
                .unwrap()
                .next()
                .expect("scripted response available"))
        });
        StructuredOutputClient::new(vec![Arc::new(provider)]).unwrap()
    }

    fn dense_embedder() -> Arc<MockDenseEmbedder> {
        let mut dense = MockDenseEmbedder::new();
        dense.expect_dimensions().return_const(2usize);
        dense
            .expect_embed_many()
            .returning(|texts| Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect()));
        Arc::new(dense)
    }

    async fn seeded_searcher(
        planner_responses: Vec<serde_json::Value>,
        judge_responses: Vec<serde_json::Value>,
    ) -> (AgenticSearcher, Uuid) {
        let collection_id = Uuid::new_v4();
        let sync_id = Uuid::new_v4();
        let destination = Arc::new(InMemoryDestination::new("test"));
        destination
            .bulk_upsert(&[
                jersey_document(collection_id, sync_id),
                noise_document(collection_id, sync_id),
            ])
            .await
            .unwrap();
        let metastore = Arc::new(InMemoryMetastore::new());
        metastore
            .upsert_entity_hash(EntityHashRecord {
                sync_id,
                source_connection_id: Uuid::new_v4(),
                collection_id,
                entity_id: "jersey-note".to_string(),
                content_hash: "h".to_string(),
                entity_type: "notion.page".to_string(),
                source_name: "notion".to_string(),
            })
            .await
            .unwrap();

        let searcher = AgenticSearcher::new(
            Planner::new(structured_client(planner_responses)),
            Judge::new(structured_client(judge_responses)),
            QueryEmbedder::new(dense_embedder(), Arc::new(HashedSparseEmbedder::new())),
            Executor::new(destination),
            CollectionInfoBuilder::new(metastore),
        );
        (searcher, collection_id)
    }

    fn hybrid_plan_json() -> serde_json::Value {
        json!({
            "query": {
                "primary": "Who owns the worn football jersey?",
                "variations": ["football jersey owner"],
            },
            "retrieval_strategy": "hybrid",
            "limit": 10,
            "offset": 0,
            "filter_groups": [],
            "reasoning": "hybrid search over the jersey phrasing",
        })
    }

    #[tokio::test]
    async fn test_hybrid_search_single_iteration_finds_the_jersey() {
        let (searcher, collection_id) = seeded_searcher(
            vec![hybrid_plan_json()],
            vec![json!({
                "should_continue": false,
                "reasoning": "the jersey note answers it",
                "useful_result_ids": ["jersey-note"],
                "answer_snippet": "The worn football jersey belongs to Sam.",
            })],
        )
        .await;

        let (emitter, mut events_rx) = EventEmitter::channel();
        let state = searcher
            .search(
                SearchRequest {
                    query: "Who owns the worn football jersey?".to_string(),
                    collection_id,
                    principals: Vec::new(),
                },
                &emitter,
            )
            .await
            .unwrap();

        // The compiled query carries one BM25 clause and one nearest
        // neighbor per dense variation.
        let compiled = state.iterations[0].query.as_ref().unwrap();
        assert_eq!(compiled.yql.matches("userInput(@query)").count(), 1);
        assert_eq!(compiled.yql.matches("nearestNeighbor(dense_embedding").count(), 2);

        let final_results = state.final_results.as_ref().unwrap();
        assert_eq!(final_results[0].original_entity_id, "jersey-note");

        let mut saw_searching = false;
        let mut saw_done = false;
        while let Ok(event) = events_rx.try_recv() {
            match event {
                SearchEvent::Searching { result_count, .. } => {
                    saw_searching = true;
                    assert!(result_count >= 1);
                }
                SearchEvent::Done { response } => {
                    saw_done = true;
                    assert!(response.answer_found);
                    assert_eq!(response.results[0].original_entity_id, "jersey-note");
                }
                _ => {}
            }
        }
        assert!(saw_searching);
        assert!(saw_done);
    }

    #[tokio::test]
    async fn test_judge_continue_drives_second_iteration() {
        let (searcher, collection_id) = seeded_searcher(
            vec![
                json!({
                    "query": { "primary": "quarterly revenue" },
                    "retrieval_strategy": "keyword",
                    "limit": 10,
                    "reasoning": "start with the literal phrase",
                }),
                hybrid_plan_json(),
            ],
            vec![
                json!({
                    "should_continue": true,
                    "reasoning": "nothing about jerseys in these results",
                    "advice": "try the jersey phrasing with hybrid retrieval",
                }),
                json!({
                    "should_continue": false,
                    "reasoning": "found it",
                    "useful_result_ids": ["jersey-note"],
                    "answer_snippet": "The worn football jersey belongs to Sam.",
                }),
            ],
        )
        .await;

        let state = searcher
            .search(
                SearchRequest {
                    query: "Who owns the worn football jersey?".to_string(),
                    collection_id,
                    principals: Vec::new(),
                },
                &EventEmitter::no_op(),
            )
            .await
            .unwrap();
        assert_eq!(state.iteration, 1);
        assert_eq!(
            state.final_results.as_ref().unwrap()[0].original_entity_id,
            "jersey-note"
        );
    }

    #[tokio::test]
    async fn test_loop_stops_at_max_iterations() {
        let continue_judgement = json!({
            "should_continue": true,
            "reasoning": "keep looking",
        });
        let (searcher, collection_id) = seeded_searcher(
            vec![hybrid_plan_json(), hybrid_plan_json(), hybrid_plan_json()],
            vec![
                continue_judgement.clone(),
                continue_judgement.clone(),
                continue_judgement,
            ],
        )
        .await;

        let state = searcher
            .search(
                SearchRequest {
                    query: "unanswerable".to_string(),
                    collection_id,
                    principals: Vec::new(),
                },
                &EventEmitter::no_op(),
            )
            .await
            .unwrap();
        assert_eq!(state.iteration, MAX_ITERATIONS - 1);
        // Falls back to the last iteration's results.
        assert!(state.final_results.is_some());
    }

    #[tokio::test]
    async fn test_execution_error_is_recorded_and_judged() {
        // A plan with an unknown field filter still executes against the
        // in-memory destination (unknown fields match nothing), so instead
        // break execution by pointing at an empty destination collection and
        // failing the embedder.
        let mut dense = MockDenseEmbedder::new();
        dense.expect_dimensions().return_const(2usize);
        dense.expect_embed_many().returning(|_| {
            Err(weft_inference::InferenceError::Unavailable(
                "embedder down".to_string(),
            ))
        });
        let destination = Arc::new(InMemoryDestination::new("test"));
        let metastore = Arc::new(InMemoryMetastore::new());
        let searcher = AgenticSearcher::new(
            Planner::new(structured_client(vec![hybrid_plan_json()])),
            Judge::new(structured_client(vec![json!({
                "should_continue": false,
                "reasoning": "execution failed, stopping",
                "error_analysis": "the embedding provider is unavailable",
            })])),
            QueryEmbedder::new(Arc::new(dense), Arc::new(HashedSparseEmbedder::new())),
            Executor::new(destination),
            CollectionInfoBuilder::new(metastore),
        );

        let state = searcher
            .search(
                SearchRequest {
                    query: "q".to_string(),
                    collection_id: Uuid::new_v4(),
                    principals: Vec::new(),
                },
                &EventEmitter::no_op(),
            )
            .await
            .unwrap();
        assert!(state.iterations[0].error.as_ref().unwrap().contains("embedder down"));
        assert!(state.final_results.as_ref().unwrap().is_empty());
    }
}
