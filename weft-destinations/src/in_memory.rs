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

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use weft_entities::Entity;
use weft_query::{
    CompiledQuery, FilterCondition, FilterGroup, FilterOperator, RetrievalStrategy, SearchResult,
};

use crate::{chunk_doc_id, ChunkDocument, Destination, DestinationError, ProcessingRequirement};

/// Reciprocal-rank-fusion constant for hybrid scoring.
const RRF_K: f64 = 60.0;

/// Reference destination holding documents in memory.
///
/// Executes the structured form of a compiled query: tenant filter, access
/// filter, user filters, then ranking per retrieval strategy (token overlap
/// for keyword, cosine for semantic, reciprocal-rank fusion for hybrid).
/// Used by tests and by replay verification.
pub struct InMemoryDestination {
    name: String,
    processing: ProcessingRequirement,
    documents: Mutex<HashMap<String, ChunkDocument>>,
}

impl InMemoryDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processing: ProcessingRequirement::Chunks,
            documents: Mutex::new(HashMap::new()),
        }
    }

    /// A self-processing variant: accepts raw entities and indexes their
    /// textual representation as a single chunk.
    pub fn self_processing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processing: ProcessingRequirement::RawEntities,
            documents: Mutex::new(HashMap::new()),
        }
    }

    pub async fn num_documents(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn doc_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn document(&self, doc_id: &str) -> Option<ChunkDocument> {
        self.documents.lock().await.get(doc_id).cloned()
    }
}

#[async_trait]
impl Destination for InMemoryDestination {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn processing(&self) -> ProcessingRequirement {
        self.processing
    }

    async fn bulk_insert_raw(
        &self,
        sync_id: Uuid,
        collection_id: Uuid,
        entities: &[Entity],
    ) -> Result<(), DestinationError> {
        let mut documents = self.documents.lock().await;
        for entity in entities {
            let common = entity.common();
            let doc_id = chunk_doc_id(sync_id, &common.entity_id, 0);
            let text = entity
                .textual_representation()
                .unwrap_or(common.name.as_str())
                .to_string();
            documents.insert(
                doc_id.clone(),
                ChunkDocument {
                    doc_id,
                    sync_id,
                    collection_id,
                    original_entity_id: common.entity_id.clone(),
                    chunk_index: 0,
                    name: common.name.clone(),
                    entity_type: common.entity_type.clone(),
                    source_name: common
                        .system_metadata
                        .as_ref()
                        .map(|metadata| metadata.source_name.clone())
                        .unwrap_or_default(),
                    content_hash: common
                        .system_metadata
                        .as_ref()
                        .and_then(|metadata| metadata.content_hash.clone())
                        .unwrap_or_default(),
                    text,
                    dense_embedding: None,
                    sparse_embedding: None,
                    breadcrumbs: common.breadcrumbs.clone(),
                    access: common
                        .system_metadata
                        .as_ref()
                        .and_then(|metadata| metadata.access.clone()),
                },
            );
        }
        Ok(())
    }

    async fn bulk_upsert(&self, batch: &[ChunkDocument]) -> Result<(), DestinationError> {
        let mut documents = self.documents.lock().await;
        for document in batch {
            documents.insert(document.doc_id.clone(), document.clone());
        }
        Ok(())
    }

    async fn bulk_delete_by_entity_ids(
        &self,
        entity_ids: &[String],
        sync_id: Uuid,
    ) -> Result<(), DestinationError> {
        let mut documents = self.documents.lock().await;
        documents.retain(|_, document| {
            document.sync_id != sync_id || !entity_ids.contains(&document.original_entity_id)
        });
        Ok(())
    }

    async fn search(&self, query: &CompiledQuery) -> Result<Vec<SearchResult>, DestinationError> {
        let documents = self.documents.lock().await;
        let spec = &query.spec;

        let candidates: Vec<&ChunkDocument> = documents
            .values()
            .filter(|document| document.collection_id == spec.collection_id)
            .filter(|document| passes_access(document, &spec.principals))
            .filter(|document| passes_filters(document, &spec.filter_groups))
            .collect();

        let dense_queries = dense_query_vectors(query);
        let keyword_ranking = rank_by(&candidates, |document| {
            keyword_score(&spec.primary_query, &document.text)
        });
        let semantic_ranking = rank_by(&candidates, |document| {
            semantic_score(&dense_queries, document)
        });

        let mut scored: Vec<(f64, &ChunkDocument)> = match spec.strategy {
            RetrievalStrategy::Keyword => keyword_ranking,
            RetrievalStrategy::Semantic => semantic_ranking,
            RetrievalStrategy::Hybrid => fuse_rrf(&keyword_ranking, &semantic_ranking),
        };
        scored.retain(|(score, _)| *score > 0.0);
        scored.sort_by(|(score_a, doc_a), (score_b, doc_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| doc_a.doc_id.cmp(&doc_b.doc_id))
        });

        Ok(scored
            .into_iter()
            .skip(spec.offset)
            .take(spec.limit)
            .map(|(score, document)| SearchResult {
                doc_id: document.doc_id.clone(),
                original_entity_id: document.original_entity_id.clone(),
                name: document.name.clone(),
                entity_type: document.entity_type.clone(),
                source_name: document.source_name.clone(),
                chunk_index: document.chunk_index,
                text: document.text.clone(),
                score,
                breadcrumbs: document.breadcrumbs.clone(),
                payload: JsonValue::Null,
            })
            .collect())
    }
}

fn passes_access(document: &ChunkDocument, principals: &[String]) -> bool {
    if principals.is_empty() {
        return true;
    }
    match &document.access {
        None => true,
        Some(access) if access.is_public => true,
        Some(access) => access
            .viewers
            .iter()
            .any(|viewer| principals.contains(viewer)),
    }
}

fn passes_filters(document: &ChunkDocument, filter_groups: &[FilterGroup]) -> bool {
    if filter_groups.is_empty() {
        return true;
    }
    filter_groups.iter().any(|group| {
        group
            .conditions
            .iter()
            .all(|condition| passes_condition(document, condition))
    })
}

fn field_value(document: &ChunkDocument, field: &str) -> Option<JsonValue> {
    match field {
        "entity_type" => Some(JsonValue::from(document.entity_type.clone())),
        "source_name" => Some(JsonValue::from(document.source_name.clone())),
        "original_entity_id" => Some(JsonValue::from(document.original_entity_id.clone())),
        "chunk_index" => Some(JsonValue::from(document.chunk_index)),
        "collection_id" => Some(JsonValue::from(document.collection_id.to_string())),
        "sync_id" => Some(JsonValue::from(document.sync_id.to_string())),
        "name" => Some(JsonValue::from(document.name.clone())),
        "hash" | "content_hash" => Some(JsonValue::from(document.content_hash.clone())),
        "access_is_public" => Some(JsonValue::from(
            document.access.as_ref().map(|access| access.is_public).unwrap_or(false),
        )),
        _ => None,
    }
}

fn passes_condition(document: &ChunkDocument, condition: &FilterCondition) -> bool {
    let Some(value) = field_value(document, &condition.field) else {
        return false;
    };
    match condition.operator {
        FilterOperator::Eq => value == condition.value,
        FilterOperator::Ne => value != condition.value,
        FilterOperator::Contains => match (value.as_str(), condition.value.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        FilterOperator::In => condition
            .value
            .as_array()
            .map(|values| values.contains(&value))
            .unwrap_or(false),
        FilterOperator::NotIn => condition
            .value
            .as_array()
            .map(|values| !values.contains(&value))
            .unwrap_or(true),
        FilterOperator::Gt | FilterOperator::Lt | FilterOperator::Ge | FilterOperator::Le => {
            let (Some(left), Some(right)) = (value.as_f64(), condition.value.as_f64()) else {
                return false;
            };
            match condition.operator {
                FilterOperator::Gt => left > right,
                FilterOperator::Lt => left < right,
                FilterOperator::Ge => left >= right,
                _ => left <= right,
            }
        }
    }
}

fn dense_query_vectors(query: &CompiledQuery) -> Vec<Vec<f32>> {
    (0..query.spec.num_dense_queries)
        .filter_map(|i| query.params.get(&format!("input.query(q{i})")))
        .filter_map(|value| value.get("values"))
        .filter_map(|values| values.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_f64())
                .map(|value| value as f32)
                .collect()
        })
        .collect()
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn keyword_score(query: &str, text: &str) -> f64 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let text_tokens = tokenize(text);
    let matches = query_tokens
        .iter()
        .filter(|token| text_tokens.contains(token))
        .count();
    matches as f64 / query_tokens.len() as f64
}

fn semantic_score(dense_queries: &[Vec<f32>], document: &ChunkDocument) -> f64 {
    let Some(embedding) = &document.dense_embedding else {
        return 0.0;
    };
    dense_queries
        .iter()
        .map(|query_vector| cosine(query_vector, embedding))
        .fold(0.0, f64::max)
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn rank_by<'a>(
    candidates: &[&'a ChunkDocument],
    score: impl Fn(&ChunkDocument) -> f64,
) -> Vec<(f64, &'a ChunkDocument)> {
    let mut ranking: Vec<(f64, &ChunkDocument)> = candidates
        .iter()
        .map(|document| (score(document), *document))
        .collect();
    ranking.sort_by(|(score_a, doc_a), (score_b, doc_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| doc_a.doc_id.cmp(&doc_b.doc_id))
    });
    ranking
}

fn fuse_rrf<'a>(
    keyword_ranking: &[(f64, &'a ChunkDocument)],
    semantic_ranking: &[(f64, &'a ChunkDocument)],
) -> Vec<(f64, &'a ChunkDocument)> {
    let mut fused: HashMap<&str, (f64, &ChunkDocument)> = HashMap::new();
    for ranking in [keyword_ranking, semantic_ranking] {
        for (rank, (score, document)) in ranking.iter().enumerate() {
            if *score <= 0.0 {
                continue;
            }
            let entry = fused
                .entry(document.doc_id.as_str())
                .or_insert((0.0, *document));
            entry.0 += 1.0 / (RRF_K + rank as f64 + 1.0);
        }
    }
    fused.into_values().collect()
}

#[cfg(test)]
mod tests {
    use weft_entities::AccessControl;
    use weft_query::{QueryBuilder, SearchPlan, SearchQuery};

    use super::*;

    fn document(
        collection_id: Uuid,
        sync_id: Uuid,
        entity_id: &str,
        chunk_index: u32,
        text: &str,
    ) -> ChunkDocument {
        ChunkDocument {
            doc_id: chunk_doc_id(sync_id, entity_id, chunk_index),
            sync_id,
            collection_id,
            original_entity_id: entity_id.to_string(),
            chunk_index,
            name: entity_id.to_string(),
            entity_type: "notion.page".to_string(),
            source_name: "notion".to_string(),
            content_hash: "hash".to_string(),
            text: text.to_string(),
            dense_embedding: Some(vec![1.0, 0.0]),
            sparse_embedding: None,
            breadcrumbs: Vec::new(),
            access: None,
        }
    }

    fn compiled(collection_id: Uuid, strategy: weft_query::RetrievalStrategy, query: &str)
        -> CompiledQuery {
        let plan = SearchPlan {
            query: SearchQuery::new(query),
            retrieval_strategy: strategy,
            limit: 10,
            offset: 0,
            filter_groups: Vec::new(),
            reasoning: String::new(),
        };
        let embeddings = weft_query::QueryEmbeddings {
            dense: vec![vec![1.0, 0.0]],
            sparse: None,
        };
        QueryBuilder::new().build(&plan, &embeddings, collection_id, &[])
    }

    #[tokio::test]
    async fn test_hybrid_search_finds_matching_entity_first() {
        let destination = InMemoryDestination::new("test");
        let collection_id = Uuid::new_v4();
        let sync_id = Uuid::new_v4();
        destination
            .bulk_upsert(&[
                document(
                    collection_id,
                    sync_id,
                    "jersey-note",
                    0,
                    "The worn football jersey belongs to Sam.",
                ),
                {
                    let mut other =
                        document(collection_id, sync_id, "recipe", 0, "How to bake bread.");
                    other.dense_embedding = Some(vec![0.0, 1.0]);
                    other
                },
            ])
            .await
            .unwrap();

        let query = compiled(
            collection_id,
            weft_query::RetrievalStrategy::Hybrid,
            "Who owns the worn football jersey?",
        );
        let results = destination.search(&query).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].original_entity_id, "jersey-note");
    }

    #[tokio::test]
    async fn test_search_is_tenant_scoped() {
        let destination = InMemoryDestination::new("test");
        let collection_a = Uuid::new_v4();
        let collection_b = Uuid::new_v4();
        let sync_id = Uuid::new_v4();
        destination
            .bulk_upsert(&[document(collection_a, sync_id, "E1", 0, "football jersey")])
            .await
            .unwrap();
        let query = compiled(collection_b, weft_query::RetrievalStrategy::Keyword, "jersey");
        assert!(destination.search(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_entity_ids_is_sync_scoped() {
        let destination = InMemoryDestination::new("test");
        let collection_id = Uuid::new_v4();
        let sync_a = Uuid::new_v4();
        let sync_b = Uuid::new_v4();
        destination
            .bulk_upsert(&[
                document(collection_id, sync_a, "E1", 0, "text"),
                document(collection_id, sync_a, "E1", 1, "text"),
                document(collection_id, sync_b, "E1", 0, "text"),
            ])
            .await
            .unwrap();
        destination
            .bulk_delete_by_entity_ids(&["E1".to_string()], sync_a)
            .await
            .unwrap();
        assert_eq!(destination.num_documents().await, 1);
    }

    #[tokio::test]
    async fn test_access_filter_allows_public_or_viewer() {
        let destination = InMemoryDestination::new("test");
        let collection_id = Uuid::new_v4();
        let sync_id = Uuid::new_v4();
        let mut private_doc = document(collection_id, sync_id, "private", 0, "football secret");
        private_doc.access = Some(AccessControl {
            is_public: false,
            viewers: vec!["user:bob".to_string()],
        });
        let mut public_doc = document(collection_id, sync_id, "public", 0, "football news");
        public_doc.access = Some(AccessControl {
            is_public: true,
            viewers: Vec::new(),
        });
        destination.bulk_upsert(&[private_doc, public_doc]).await.unwrap();

        let plan = SearchPlan {
            query: SearchQuery::new("football"),
            retrieval_strategy: weft_query::RetrievalStrategy::Keyword,
            limit: 10,
            offset: 0,
            filter_groups: Vec::new(),
            reasoning: String::new(),
        };
        let query = QueryBuilder::new().build(
            &plan,
            &weft_query::QueryEmbeddings::default(),
            collection_id,
            &["user:alice".to_string()],
        );
        let results = destination.search(&query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].original_entity_id, "public");
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_doc_id() {
        let destination = InMemoryDestination::new("test");
        let collection_id = Uuid::new_v4();
        let sync_id = Uuid::new_v4();
        let doc = document(collection_id, sync_id, "E1", 0, "text");
        destination.bulk_upsert(&[doc.clone()]).await.unwrap();
        destination.bulk_upsert(&[doc]).await.unwrap();
        assert_eq!(destination.num_documents().await, 1);
    }
}
