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
use serde_json::{json, Value as JsonValue};

use weft_entities::Entity;

use crate::cursor::CursorUpdate;
use crate::source::{EntitySink, Source, SourceError};

/// Source emitting a fixed list of entities. Test and backfill vehicle.
pub struct VecSource {
    entities: Vec<Entity>,
    cursor: Option<CursorUpdate>,
    num_emitted: usize,
}

impl VecSource {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self {
            entities,
            cursor: None,
            num_emitted: 0,
        }
    }

    /// Cursor to publish after a complete run.
    pub fn with_cursor(mut self, cursor: CursorUpdate) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

#[async_trait]
impl Source for VecSource {
    fn name(&self) -> String {
        "VecSource".to_string()
    }

    async fn produce(&mut self, sink: &EntitySink) -> Result<(), SourceError> {
        for entity in self.entities.drain(..) {
            sink.send(entity).await?;
            self.num_emitted += 1;
        }
        Ok(())
    }

    fn published_cursor(&self) -> Option<CursorUpdate> {
        self.cursor.clone()
    }

    fn observable_state(&self) -> JsonValue {
        json!({ "num_emitted": self.num_emitted })
    }
}
