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

use weft_entities::Breadcrumb;

/// One retrieved chunk document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Deterministic document id of the chunk.
    pub doc_id: String,
    /// Id of the entity the chunk was cut from.
    pub original_entity_id: String,
    pub name: String,
    pub entity_type: String,
    pub source_name: String,
    pub chunk_index: u32,
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
    #[serde(default)]
    pub payload: JsonValue,
}

impl SearchResult {
    /// Markdown rendering used in judge prompts and tool responses. Records
    /// are always rendered whole; budgeting drops whole records instead of
    /// truncating.
    pub fn to_markdown(&self) -> String {
        let breadcrumb_path = self
            .breadcrumbs
            .iter()
            .map(|breadcrumb| breadcrumb.name.as_str())
            .collect::<Vec<_>>()
            .join(" > ");
        let mut lines = vec![
            format!("**{}** (`{}`)", self.name, self.original_entity_id),
            format!(
                "- source: {} | type: {} | chunk: {} | score: {:.4}",
                self.source_name, self.entity_type, self.chunk_index, self.score
            ),
        ];
        if !breadcrumb_path.is_empty() {
            lines.push(format!("- path: {breadcrumb_path}"));
        }
        lines.push(String::new());
        lines.push(self.text.clone());
        lines.join("\n")
    }

    pub fn format_results_for_logging(results: &[SearchResult]) -> String {
        results
            .iter()
            .enumerate()
            .map(|(i, result)| {
                format!(
                    "\n  {}. [{:.4}] {} ({}#{})",
                    i + 1,
                    result.score,
                    result.name,
                    result.original_entity_id,
                    result.chunk_index
                )
            })
            .collect()
    }
}
