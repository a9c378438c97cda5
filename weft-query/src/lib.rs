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

//! # Query compilation
//!
//! The planner produces a [`SearchPlan`]; this crate compiles it, together
//! with the query embeddings and the tenant scope, into a [`CompiledQuery`]:
//! a YQL string plus typed parameters, the only form destinations consume.

mod builder;
mod filter_translator;
mod plan;
mod result;

pub use builder::{QueryBuilder, TARGET_HITS};
pub use filter_translator::FilterTranslator;
pub use plan::{
    FilterCondition, FilterGroup, FilterOperator, QueryEmbeddings, RetrievalStrategy, SearchPlan,
    SearchQuery,
};
pub use result::SearchResult;

use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// A compiled vector-DB query: the wire contract is `{ yql, params }`.
///
/// `spec` is the structured form the builder compiled from; embedded
/// destinations (in-memory, tests) execute it directly instead of parsing
/// YQL back apart. HTTP destinations ship only `yql` and `params`.
#[derive(Clone, Debug)]
pub struct CompiledQuery {
    pub yql: String,
    pub params: Map<String, JsonValue>,
    pub spec: CompiledSpec,
}

impl CompiledQuery {
    /// Params with embedding vectors elided, for logs and judge prompts.
    pub fn format_params_for_logging(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        for (key, value) in &self.params {
            if key.starts_with("input.query(") || key.starts_with("ranking.features.query(") {
                lines.push(format!("{key}: <embedding>"));
            } else {
                lines.push(format!("{key}: {value}"));
            }
        }
        lines.join("\n")
    }
}

/// Structured form of a compiled query.
#[derive(Clone, Debug)]
pub struct CompiledSpec {
    pub collection_id: Uuid,
    pub strategy: RetrievalStrategy,
    pub primary_query: String,
    pub num_dense_queries: usize,
    pub limit: usize,
    pub offset: usize,
    pub filter_groups: Vec<FilterGroup>,
    pub principals: Vec<String>,
}
