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

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use weft_entities::{Breadcrumb, Entity};
use weft_query::{CompiledQuery, SearchResult};

use crate::{ChunkDocument, Destination, DestinationError, ProcessingRequirement};

/// Feed concurrency for bulk upserts.
const MAX_CONCURRENT_FEEDS: usize = 8;

const DOCUMENT_NAMESPACE: &str = "weft";
const DOCUMENT_TYPE: &str = "chunk";

/// Destination speaking the Vespa-style HTTP surface: `POST /search/` with
/// `{ yql, ...params }` and the `/document/v1` feed API.
///
/// The store chunks nothing: this destination receives pre-chunked documents
/// with embeddings (`ProcessingRequirement::Chunks`).
pub struct HttpSearchDestination {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpSearchDestination {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn doc_url_for(base_url: &str, doc_id: &str) -> String {
        format!("{base_url}/document/v1/{DOCUMENT_NAMESPACE}/{DOCUMENT_TYPE}/docid/{doc_id}")
    }

    async fn check_response(
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, DestinationError> {
        let response = response.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(DestinationError::Unavailable(format!("{status}: {message}")))
        } else {
            Err(DestinationError::Permanent {
                status: Some(status.as_u16()),
                message,
            })
        }
    }

    fn index_fields(document: &ChunkDocument) -> JsonValue {
        let mut fields = json!({
            "weft_system_metadata_sync_id": document.sync_id.to_string(),
            "weft_system_metadata_collection_id": document.collection_id.to_string(),
            "weft_system_metadata_original_entity_id": document.original_entity_id,
            "weft_system_metadata_chunk_index": document.chunk_index,
            "weft_system_metadata_entity_type": document.entity_type,
            "weft_system_metadata_source_name": document.source_name,
            "weft_system_metadata_hash": document.content_hash,
            "name": document.name,
            "text_content": document.text,
            "breadcrumbs": document
                .breadcrumbs
                .iter()
                .map(|breadcrumb| json!([breadcrumb.entity_id, breadcrumb.name, breadcrumb.kind]))
                .collect::<Vec<_>>(),
        });
        let fields_map = fields.as_object_mut().expect("literal object");
        if let Some(dense) = &document.dense_embedding {
            fields_map.insert("dense_embedding".to_string(), json!({ "values": dense }));
        }
        if let Some(sparse) = &document.sparse_embedding {
            let mut cells = Map::new();
            for (index, value) in sparse.indices.iter().zip(sparse.values.iter()) {
                cells.insert(index.to_string(), json!(value));
            }
            fields_map.insert("sparse_embedding".to_string(), json!({ "cells": cells }));
        }
        if let Some(access) = &document.access {
            fields_map.insert("access_is_public".to_string(), json!(access.is_public));
            fields_map.insert("access_viewers".to_string(), json!(access.viewers));
        }
        fields
    }

    fn parse_hit(hit: &JsonValue) -> Option<SearchResult> {
        let fields = hit.get("fields")?;
        let text_field = |key: &str| {
            fields
                .get(key)
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let breadcrumbs = fields
            .get("breadcrumbs")
            .and_then(JsonValue::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(JsonValue::as_array)
                    .filter(|triple| triple.len() == 3)
                    .map(|triple| {
                        Breadcrumb::new(
                            triple[0].as_str().unwrap_or_default(),
                            triple[1].as_str().unwrap_or_default(),
                            triple[2].as_str().unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(SearchResult {
            doc_id: hit
                .get("id")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .rsplit("::")
                .next()
                .unwrap_or_default()
                .to_string(),
            original_entity_id: text_field("weft_system_metadata_original_entity_id"),
            name: text_field("name"),
            entity_type: text_field("weft_system_metadata_entity_type"),
            source_name: text_field("weft_system_metadata_source_name"),
            chunk_index: fields
                .get("weft_system_metadata_chunk_index")
                .and_then(JsonValue::as_u64)
                .unwrap_or_default() as u32,
            text: text_field("text_content"),
            score: hit
                .get("relevance")
                .and_then(JsonValue::as_f64)
                .unwrap_or_default(),
            breadcrumbs,
            payload: fields.clone(),
        })
    }
}

#[async_trait]
impl Destination for HttpSearchDestination {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn processing(&self) -> ProcessingRequirement {
        ProcessingRequirement::Chunks
    }

    async fn bulk_insert_raw(
        &self,
        _sync_id: Uuid,
        _collection_id: Uuid,
        _entities: &[Entity],
    ) -> Result<(), DestinationError> {
        Err(DestinationError::Permanent {
            status: None,
            message: "this destination requires pre-chunked documents".to_string(),
        })
    }

    async fn bulk_upsert(&self, documents: &[ChunkDocument]) -> Result<(), DestinationError> {
        debug!(destination = %self.name, num_documents = documents.len(), "bulk-upsert");
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let requests = documents
            .iter()
            .map(|document| {
                let url = Self::doc_url_for(&base_url, &document.doc_id);
                let body = json!({ "fields": Self::index_fields(document) });
                let client = client.clone();
                async move {
                    Self::check_response(client.post(&url).json(&body).send().await).await?;
                    Ok::<(), DestinationError>(())
                }
            })
            .collect::<Vec<_>>();
        stream::iter(requests)
            .buffer_unordered(MAX_CONCURRENT_FEEDS)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn bulk_delete_by_entity_ids(
        &self,
        entity_ids: &[String],
        sync_id: Uuid,
    ) -> Result<(), DestinationError> {
        for entity_id in entity_ids {
            let selection = format!(
                "{DOCUMENT_TYPE}.weft_system_metadata_original_entity_id=='{}' and \
                 {DOCUMENT_TYPE}.weft_system_metadata_sync_id=='{sync_id}'",
                entity_id.replace('\'', "\\'")
            );
            let url = format!(
                "{}/document/v1/{DOCUMENT_NAMESPACE}/{DOCUMENT_TYPE}/docid",
                self.base_url
            );
            let request = self
                .client
                .delete(&url)
                .query(&[("selection", selection.as_str()), ("cluster", DOCUMENT_NAMESPACE)]);
            Self::check_response(request.send().await).await?;
        }
        Ok(())
    }

    async fn search(&self, query: &CompiledQuery) -> Result<Vec<SearchResult>, DestinationError> {
        let mut body = Map::new();
        body.insert("yql".to_string(), JsonValue::from(query.yql.clone()));
        for (key, value) in &query.params {
            body.insert(key.clone(), value.clone());
        }
        let url = format!("{}/search/", self.base_url);
        let response =
            Self::check_response(self.client.post(&url).json(&JsonValue::Object(body)).send().await)
                .await?;
        let payload: JsonValue = response
            .json()
            .await
            .map_err(|error| DestinationError::Serialization(error.to_string()))?;
        let hits = payload
            .pointer("/root/children")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(hits.iter().filter_map(Self::parse_hit).collect())
    }
}

fn map_transport_error(error: reqwest::Error) -> DestinationError {
    if error.is_timeout() {
        DestinationError::Timeout(error.to_string())
    } else {
        DestinationError::Unavailable(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::chunk_doc_id;
    use weft_common::retry::{ClassifyError, ErrorClass};

    fn test_document(sync_id: Uuid) -> ChunkDocument {
        ChunkDocument {
            doc_id: chunk_doc_id(sync_id, "E1", 0),
            sync_id,
            collection_id: Uuid::new_v4(),
            original_entity_id: "E1".to_string(),
            chunk_index: 0,
            name: "note".to_string(),
            entity_type: "notion.page".to_string(),
            source_name: "notion".to_string(),
            content_hash: "hash".to_string(),
            text: "hello".to_string(),
            dense_embedding: Some(vec![0.1, 0.2]),
            sparse_embedding: None,
            breadcrumbs: Vec::new(),
            access: None,
        }
    }

    fn test_query() -> CompiledQuery {
        let plan = weft_query::SearchPlan {
            query: weft_query::SearchQuery::new("hello"),
            retrieval_strategy: weft_query::RetrievalStrategy::Keyword,
            limit: 10,
            offset: 0,
            filter_groups: Vec::new(),
            reasoning: String::new(),
        };
        weft_query::QueryBuilder::new().build(
            &plan,
            &weft_query::QueryEmbeddings::default(),
            Uuid::new_v4(),
            &[],
        )
    }

    #[tokio::test]
    async fn test_search_parses_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "root": {
                    "children": [{
                        "id": "id:weft:chunk::abc123",
                        "relevance": 0.87,
                        "fields": {
                            "weft_system_metadata_original_entity_id": "E1",
                            "weft_system_metadata_entity_type": "notion.page",
                            "weft_system_metadata_source_name": "notion",
                            "weft_system_metadata_chunk_index": 2,
                            "name": "note",
                            "text_content": "hello world",
                            "breadcrumbs": [["W", "Workspace", "workspace"]],
                        }
                    }]
                }
            })))
            .mount(&server)
            .await;

        let destination = HttpSearchDestination::new("vespa", server.uri());
        let results = destination.search(&test_query()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, "abc123");
        assert_eq!(results[0].original_entity_id, "E1");
        assert_eq!(results[0].chunk_index, 2);
        assert_eq!(results[0].breadcrumbs[0].name, "Workspace");
        assert!((results[0].score - 0.87).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_bulk_upsert_feeds_each_document() {
        let server = MockServer::start().await;
        let sync_id = Uuid::new_v4();
        let document = test_document(sync_id);
        Mock::given(method("POST"))
            .and(path(format!(
                "/document/v1/weft/chunk/docid/{}",
                document.doc_id
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let destination = HttpSearchDestination::new("vespa", server.uri());
        destination.bulk_upsert(&[document]).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let destination = HttpSearchDestination::new("vespa", server.uri());
        let error = destination.search(&test_query()).await.unwrap_err();
        assert_eq!(error.error_class(), ErrorClass::Retryable);

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search/"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad yql"))
            .mount(&server)
            .await;
        let destination = HttpSearchDestination::new("vespa", server.uri());
        let error = destination.search(&test_query()).await.unwrap_err();
        assert_eq!(error.error_class(), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn test_delete_by_entity_ids_uses_selection() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/document/v1/weft/chunk/docid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(2)
            .mount(&server)
            .await;
        let destination = HttpSearchDestination::new("vespa", server.uri());
        destination
            .bulk_delete_by_entity_ids(&["E1".to_string(), "E2".to_string()], Uuid::new_v4())
            .await
            .unwrap();
    }
}
