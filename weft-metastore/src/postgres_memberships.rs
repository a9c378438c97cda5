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

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use weft_entities::{Membership, MemberType};

use crate::MetastoreError;

/// Upsert chunk size. Postgres caps statements at 32,767 bind parameters;
/// 2000 rows at 4 columns stays far under the limit.
const UPSERT_CHUNK_SIZE: usize = 2000;

/// Access-control membership persistence backed by Postgres.
///
/// Used when membership volume outgrows the in-memory metastore; the table is
/// `access_control_memberships (source_connection_id, member_id, member_type,
/// group_id)` with a unique key over all four columns.
pub struct PostgresMembershipStore {
    pool: PgPool,
}

impl PostgresMembershipStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn bulk_upsert(
        &self,
        source_connection_id: Uuid,
        memberships: &[Membership],
    ) -> Result<u64, MetastoreError> {
        if memberships.is_empty() {
            return Ok(0);
        }
        let mut total = 0u64;
        for chunk in memberships.chunks(UPSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO access_control_memberships \
                 (source_connection_id, member_id, member_type, group_id) ",
            );
            builder.push_values(chunk, |mut row, membership| {
                row.push_bind(source_connection_id)
                    .push_bind(&membership.member_id)
                    .push_bind(membership.member_type.as_str())
                    .push_bind(&membership.group_id);
            });
            builder.push(
                " ON CONFLICT (source_connection_id, member_id, member_type, group_id) DO NOTHING",
            );
            let result = builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|error| MetastoreError::Unavailable(error.to_string()))?;
            total += result.rows_affected();
            if memberships.len() > UPSERT_CHUNK_SIZE {
                info!(
                    upserted = total,
                    total = memberships.len(),
                    "membership-upsert-progress"
                );
            }
        }
        Ok(total)
    }

    pub async fn bulk_delete_by_member(
        &self,
        source_connection_id: Uuid,
        member_id: &str,
        member_type: MemberType,
    ) -> Result<u64, MetastoreError> {
        let result = sqlx::query(
            "DELETE FROM access_control_memberships \
             WHERE source_connection_id = $1 AND member_id = $2 AND member_type = $3",
        )
        .bind(source_connection_id)
        .bind(member_id)
        .bind(member_type.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| MetastoreError::Unavailable(error.to_string()))?;
        Ok(result.rows_affected())
    }

    pub async fn bulk_delete_by_group(
        &self,
        source_connection_id: Uuid,
        group_id: &str,
    ) -> Result<u64, MetastoreError> {
        let result = sqlx::query(
            "DELETE FROM access_control_memberships \
             WHERE source_connection_id = $1 AND group_id = $2",
        )
        .bind(source_connection_id)
        .bind(group_id)
        .execute(&self.pool)
        .await
        .map_err(|error| MetastoreError::Unavailable(error.to_string()))?;
        Ok(result.rows_affected())
    }
}
