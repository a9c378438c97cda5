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

//! # Agentic search
//!
//! A bounded iterative loop over the indexed corpus: a planner LLM proposes
//! queries, filters and a retrieval strategy; the embedder produces dense
//! and sparse query embeddings; the builder compiles a vector-DB query; the
//! executor runs it; and a judge LLM decides whether the results suffice or
//! another iteration is warranted. Progress streams to the caller as typed
//! events.
//!
//! A second composer drives the same capability through provider-agnostic
//! tool calls (`search` / `submit_answer`) instead of the fixed loop.

mod agent;
mod collection_info;
mod composer;
mod context;
mod embedder;
mod events;
mod executor;
mod judge;
mod planner;
mod response;
mod state;
mod tools;

pub use agent::{AgenticSearcher, SearchRequest};
pub use collection_info::CollectionInfoBuilder;
pub use composer::{ToolCallComposer, MAX_TOOL_TURNS};
pub use embedder::QueryEmbedder;
pub use events::{EventEmitter, SearchEvent};
pub use executor::Executor;
pub use judge::{Judge, Judgement};
pub use planner::Planner;
pub use response::{Answer, Citation, SearchResponse};
pub use state::{IterationRecord, SearchState, MAX_ITERATIONS};
pub use tools::{
    format_results_for_tool_response, parse_submit_answer, search_tool_definition,
    submit_answer_tool_definition,
};

use weft_common::ErrorSeverity;
use weft_destinations::DestinationError;
use weft_inference::InferenceError;
use weft_metastore::MetastoreError;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("destination error: {0}")]
    Destination(#[from] DestinationError),
    #[error("metastore error: {0}")]
    Metastore(#[from] MetastoreError),
    #[error("invalid search plan: {0}")]
    InvalidPlan(String),
}

impl SearchError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SearchError::Inference(error) => error.severity(),
            SearchError::Destination(error) => error.severity(),
            SearchError::Metastore(error) => error.severity(),
            SearchError::InvalidPlan(_) => ErrorSeverity::Expected,
        }
    }
}
