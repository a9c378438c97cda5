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

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use weft_metastore::Metastore;

use crate::SearchError;

/// Summarizes what a collection contains, for the planner prompt and the
/// first-iteration progress event.
pub struct CollectionInfoBuilder {
    metastore: Arc<dyn Metastore>,
}

impl CollectionInfoBuilder {
    pub fn new(metastore: Arc<dyn Metastore>) -> Self {
        Self { metastore }
    }

    /// Markdown: entity counts per source per entity type.
    pub async fn build_markdown(&self, collection_id: Uuid) -> Result<String, SearchError> {
        let counts = self.metastore.entity_counts(collection_id).await?;
        if counts.is_empty() {
            return Ok("(The collection is empty.)".to_string());
        }
        let mut by_source: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        let mut total: u64 = 0;
        for count in counts {
            total += count.count;
            by_source
                .entry(count.source_name)
                .or_default()
                .push((count.entity_type, count.count));
        }
        let mut lines = vec![format!("Total entities: {total}"), String::new()];
        for (source_name, entity_counts) in &by_source {
            lines.push(format!("## {source_name}"));
            for (entity_type, count) in entity_counts {
                lines.push(format!("- `{entity_type}`: {count}"));
            }
            lines.push(String::new());
        }
        Ok(lines.join("\n"))
    }

    /// One-line summary for the first progress event, e.g.
    /// `"Searching 42 entities (slack: 40 slack.message, 2 slack.channel)"`.
    pub async fn build_summary_line(&self, collection_id: Uuid) -> Result<String, SearchError> {
        let counts = self.metastore.entity_counts(collection_id).await?;
        let total: u64 = counts.iter().map(|count| count.count).sum();
        let mut by_source: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for count in counts {
            by_source
                .entry(count.source_name)
                .or_default()
                .push(format!("{} {}", count.count, count.entity_type));
        }
        let sources_detail = by_source
            .into_iter()
            .map(|(source_name, parts)| format!("{source_name}: {}", parts.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");
        Ok(format!("Searching {total} entities ({sources_detail})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_metastore::{EntityHashRecord, InMemoryMetastore};

    async fn seeded_metastore(collection_id: Uuid) -> Arc<InMemoryMetastore> {
        let metastore = Arc::new(InMemoryMetastore::new());
        for (i, (source, entity_type)) in [
            ("slack", "slack.message"),
            ("slack", "slack.message"),
            ("notion", "notion.page"),
        ]
        .iter()
        .enumerate()
        {
            metastore
                .upsert_entity_hash(EntityHashRecord {
                    sync_id: Uuid::new_v4(),
                    source_connection_id: Uuid::new_v4(),
                    collection_id,
                    entity_id: format!("E{i}"),
                    content_hash: format!("h{i}"),
                    entity_type: entity_type.to_string(),
                    source_name: source.to_string(),
                })
                .await
                .unwrap();
        }
        metastore
    }

    #[tokio::test]
    async fn test_markdown_groups_by_source() {
        let collection_id = Uuid::new_v4();
        let metastore = seeded_metastore(collection_id).await;
        let builder = CollectionInfoBuilder::new(metastore);
        let markdown = builder.build_markdown(collection_id).await.unwrap();
        assert!(markdown.contains("Total entities: 3"));
        assert!(markdown.contains("## slack"));
        assert!(markdown.contains("- `slack.message`: 2"));
        assert!(markdown.contains("## notion"));
    }

    #[tokio::test]
    async fn test_empty_collection_markdown() {
        let builder = CollectionInfoBuilder::new(Arc::new(InMemoryMetastore::new()));
        let markdown = builder.build_markdown(Uuid::new_v4()).await.unwrap();
        assert!(markdown.contains("empty"));
    }

    #[tokio::test]
    async fn test_summary_line_counts_per_source() {
        let collection_id = Uuid::new_v4();
        let metastore = seeded_metastore(collection_id).await;
        let builder = CollectionInfoBuilder::new(metastore);
        let line = builder.build_summary_line(collection_id).await.unwrap();
        assert!(line.starts_with("Searching 3 entities"));
        assert!(line.contains("slack: 2 slack.message"));
    }
}
