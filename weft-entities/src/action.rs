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

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::entity::ProcessedEntity;

/// The decision the classifier makes for one entity in a given job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Insert,
    Update,
    Delete,
    Skip,
}

/// A resolved per-entity action, carrying the processed entity where the
/// handlers need it.
#[derive(Clone, Debug)]
pub enum EntityAction {
    Insert(ProcessedEntity),
    Update(ProcessedEntity),
    Delete { entity_id: String },
    Skip { entity_id: String },
}

impl EntityAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            EntityAction::Insert(_) => ActionKind::Insert,
            EntityAction::Update(_) => ActionKind::Update,
            EntityAction::Delete { .. } => ActionKind::Delete,
            EntityAction::Skip { .. } => ActionKind::Skip,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            EntityAction::Insert(processed) | EntityAction::Update(processed) => {
                processed.entity.entity_id()
            }
            EntityAction::Delete { entity_id } | EntityAction::Skip { entity_id } => entity_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionBatchError {
    #[error("entity `{entity_id}` appears more than once in the batch")]
    DuplicateEntity { entity_id: String },
}

/// Actions grouped within one worker's output so handlers can bulk-operate.
///
/// Within a single batch an `entity_id` appears at most once; pushing a
/// duplicate is rejected.
#[derive(Debug, Default)]
pub struct ActionBatch {
    actions: Vec<EntityAction>,
    entity_ids: HashSet<String>,
}

impl ActionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: EntityAction) -> Result<(), ActionBatchError> {
        let entity_id = action.entity_id().to_string();
        if !self.entity_ids.insert(entity_id.clone()) {
            return Err(ActionBatchError::DuplicateEntity { entity_id });
        }
        self.actions.push(action);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn actions(&self) -> &[EntityAction] {
        &self.actions
    }

    pub fn inserts(&self) -> impl Iterator<Item = &ProcessedEntity> {
        self.actions.iter().filter_map(|action| match action {
            EntityAction::Insert(processed) => Some(processed),
            _ => None,
        })
    }

    pub fn updates(&self) -> impl Iterator<Item = &ProcessedEntity> {
        self.actions.iter().filter_map(|action| match action {
            EntityAction::Update(processed) => Some(processed),
            _ => None,
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|action| match action {
            EntityAction::Delete { entity_id } => Some(entity_id.as_str()),
            _ => None,
        })
    }

    /// True if any action mutates a destination (anything but `Skip`).
    pub fn has_mutations(&self) -> bool {
        self.actions
            .iter()
            .any(|action| action.kind() != ActionKind::Skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityCommon};

    fn processed(entity_id: &str) -> ProcessedEntity {
        ProcessedEntity {
            entity: Entity::Base {
                common: EntityCommon::new(entity_id, entity_id, "test.entity"),
            },
            chunks: Vec::new(),
        }
    }

    #[test]
    fn test_batch_rejects_duplicate_entity_ids() {
        let mut batch = ActionBatch::new();
        batch.push(EntityAction::Insert(processed("E1"))).unwrap();
        let error = batch
            .push(EntityAction::Delete { entity_id: "E1".to_string() })
            .unwrap_err();
        assert!(matches!(error, ActionBatchError::DuplicateEntity { .. }));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_batch_partitions_by_kind() {
        let mut batch = ActionBatch::new();
        batch.push(EntityAction::Insert(processed("E1"))).unwrap();
        batch.push(EntityAction::Update(processed("E2"))).unwrap();
        batch
            .push(EntityAction::Delete { entity_id: "E3".to_string() })
            .unwrap();
        batch
            .push(EntityAction::Skip { entity_id: "E4".to_string() })
            .unwrap();
        assert_eq!(batch.inserts().count(), 1);
        assert_eq!(batch.updates().count(), 1);
        assert_eq!(batch.deletes().count(), 1);
        assert!(batch.has_mutations());
    }

    #[test]
    fn test_skip_only_batch_has_no_mutations() {
        let mut batch = ActionBatch::new();
        batch
            .push(EntityAction::Skip { entity_id: "E1".to_string() })
            .unwrap();
        assert!(!batch.has_mutations());
    }
}
