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

use std::sync::Arc;

use weft_inference::{DenseEmbedder, SparseEmbedder};
use weft_query::{QueryEmbeddings, RetrievalStrategy, SearchQuery};

use crate::SearchError;

/// Embeds a plan's queries per the retrieval strategy: dense embeddings for
/// every query text (primary first) on semantic/hybrid, a sparse embedding
/// of the primary query on keyword/hybrid.
pub struct QueryEmbedder {
    dense: Arc<dyn DenseEmbedder>,
    sparse: Arc<dyn SparseEmbedder>,
}

impl QueryEmbedder {
    pub fn new(dense: Arc<dyn DenseEmbedder>, sparse: Arc<dyn SparseEmbedder>) -> Self {
        Self { dense, sparse }
    }

    pub async fn embed(
        &self,
        query: &SearchQuery,
        strategy: RetrievalStrategy,
    ) -> Result<QueryEmbeddings, SearchError> {
        let mut embeddings = QueryEmbeddings::default();
        if strategy.uses_dense() {
            embeddings.dense = self.dense.embed_many(&query.texts()).await?;
        }
        if strategy.uses_sparse() {
            embeddings.sparse = Some(self.sparse.embed(&query.primary).await?);
        }
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_inference::{HashedSparseEmbedder, MockDenseEmbedder};

    fn embedder() -> QueryEmbedder {
        let mut dense = MockDenseEmbedder::new();
        dense.expect_dimensions().return_const(2usize);
        dense
            .expect_embed_many()
            .returning(|texts| Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect()));
        QueryEmbedder::new(Arc::new(dense), Arc::new(HashedSparseEmbedder::new()))
    }

    #[tokio::test]
    async fn test_semantic_embeds_all_variations_no_sparse() {
        let query = SearchQuery {
            primary: "jersey".to_string(),
            variations: vec!["shirt".to_string(), "kit".to_string()],
        };
        let embeddings = embedder()
            .embed(&query, RetrievalStrategy::Semantic)
            .await
            .unwrap();
        assert_eq!(embeddings.dense.len(), 3);
        assert!(embeddings.sparse.is_none());
    }

    #[tokio::test]
    async fn test_keyword_embeds_sparse_only() {
        let query = SearchQuery::new("jersey owner");
        let embeddings = embedder()
            .embed(&query, RetrievalStrategy::Keyword)
            .await
            .unwrap();
        assert!(embeddings.dense.is_empty());
        assert!(embeddings.sparse.is_some());
    }

    #[tokio::test]
    async fn test_hybrid_embeds_both() {
        let query = SearchQuery {
            primary: "jersey".to_string(),
            variations: vec!["shirt".to_string()],
        };
        let embeddings = embedder()
            .embed(&query, RetrievalStrategy::Hybrid)
            .await
            .unwrap();
        assert_eq!(embeddings.dense.len(), 2);
        assert!(embeddings.sparse.is_some());
    }
}
