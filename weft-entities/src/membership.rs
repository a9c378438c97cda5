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

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberType {
    User,
    Group,
}

impl MemberType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberType::User => "user",
            MemberType::Group => "group",
        }
    }
}

/// One access-control membership row: `member` belongs to `group`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub member_id: String,
    pub member_type: MemberType,
    pub group_id: String,
}

/// Action taxonomy for access-control membership records.
///
/// Full syncs upsert the whole universe; incremental syncs delete specific
/// memberships, or everything for a member/group the upstream removed.
#[derive(Clone, Debug)]
pub enum MembershipAction {
    Upsert(Membership),
    Delete {
        member_id: String,
        member_type: MemberType,
        group_id: String,
    },
    DeleteByMember {
        member_id: String,
        member_type: MemberType,
    },
    DeleteByGroup {
        group_id: String,
    },
}

/// Membership actions grouped for bulk persistence.
#[derive(Debug, Default)]
pub struct MembershipBatch {
    pub upserts: Vec<Membership>,
    pub deletes: Vec<(String, MemberType, String)>,
    pub delete_members: Vec<(String, MemberType)>,
    pub delete_groups: Vec<String>,
}

impl MembershipBatch {
    pub fn push(&mut self, action: MembershipAction) {
        match action {
            MembershipAction::Upsert(membership) => self.upserts.push(membership),
            MembershipAction::Delete {
                member_id,
                member_type,
                group_id,
            } => self.deletes.push((member_id, member_type, group_id)),
            MembershipAction::DeleteByMember {
                member_id,
                member_type,
            } => self.delete_members.push((member_id, member_type)),
            MembershipAction::DeleteByGroup { group_id } => self.delete_groups.push(group_id),
        }
    }

    pub fn has_mutations(&self) -> bool {
        !self.upserts.is_empty()
            || !self.deletes.is_empty()
            || !self.delete_members.is_empty()
            || !self.delete_groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_routes_actions() {
        let mut batch = MembershipBatch::default();
        batch.push(MembershipAction::Upsert(Membership {
            member_id: "u1".to_string(),
            member_type: MemberType::User,
            group_id: "g1".to_string(),
        }));
        batch.push(MembershipAction::DeleteByGroup { group_id: "g2".to_string() });
        assert_eq!(batch.upserts.len(), 1);
        assert_eq!(batch.delete_groups.len(), 1);
        assert!(batch.has_mutations());
    }

    #[test]
    fn test_empty_batch_has_no_mutations() {
        assert!(!MembershipBatch::default().has_mutations());
    }
}
