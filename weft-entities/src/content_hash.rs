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

//! Content hashing over the embeddable surface of an entity.
//!
//! The hash must be stable across process restarts and implementation
//! changes, so the input is fully canonical: lowercase field names, NFC
//! normalized text, sorted object keys, no whitespace. `Timestamp` role
//! fields and the pipeline-owned system metadata are excluded.

use serde_json::{Map, Value as JsonValue};
use sha1::{Digest, Sha1};
use unicode_normalization::UnicodeNormalization;

use crate::entity::{Entity, FieldRole};

/// Serializes `value` as canonical JSON: object keys sorted, no whitespace,
/// strings NFC normalized.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(boolean) => out.push_str(if *boolean { "true" } else { "false" }),
        JsonValue::Number(number) => out.push_str(&number.to_string()),
        JsonValue::String(string) => {
            let normalized: String = string.nfc().collect();
            // serde_json string serialization cannot fail.
            out.push_str(&serde_json::to_string(&normalized).unwrap_or_default());
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let normalized_key: String = key.nfc().collect();
                out.push_str(&serde_json::to_string(&normalized_key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Computes the content hash of an entity: sha1 over the canonical JSON of
/// the deterministic field set plus the normalized textual representation.
pub fn content_hash(entity: &Entity) -> String {
    let common = entity.common();
    let mut surface = Map::new();
    surface.insert("entity_id".to_string(), JsonValue::from(common.entity_id.clone()));
    surface.insert("name".to_string(), JsonValue::from(common.name.clone()));
    surface.insert(
        "breadcrumbs".to_string(),
        JsonValue::Array(
            common
                .breadcrumbs
                .iter()
                .map(|breadcrumb| {
                    JsonValue::Array(vec![
                        JsonValue::from(breadcrumb.entity_id.clone()),
                        JsonValue::from(breadcrumb.name.clone()),
                        JsonValue::from(breadcrumb.kind.clone()),
                    ])
                })
                .collect(),
        ),
    );
    let mut fields = Map::new();
    for field in &common.fields {
        if matches!(field.role, FieldRole::Timestamp) {
            continue;
        }
        fields.insert(field.name.to_lowercase(), field.value.clone());
    }
    surface.insert("fields".to_string(), JsonValue::Object(fields));
    if let Some(text) = entity.textual_representation() {
        surface.insert("text".to_string(), JsonValue::from(text.to_string()));
    }
    if let Entity::File(file) = entity {
        surface.insert("download_url".to_string(), JsonValue::from(file.download_url.clone()));
        if let Some(total_size) = file.total_size {
            surface.insert("total_size".to_string(), JsonValue::from(total_size));
        }
    }
    let canonical = canonical_json(&JsonValue::Object(surface));
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::entity::{ChunkEntity, ContentKind, EntityCommon, EntityField};

    fn entity_with_text(text: &str) -> Entity {
        let mut common = EntityCommon::new("E1", "note", "notion.page");
        common.fields = vec![EntityField::embeddable("title", "note")];
        Entity::Chunk(ChunkEntity {
            common,
            textual_representation: text.to_string(),
            content_kind: ContentKind::Prose,
        })
    }

    #[test]
    fn test_hash_is_deterministic() {
        let entity = entity_with_text("hello world");
        assert_eq!(content_hash(&entity), content_hash(&entity.clone()));
    }

    #[test]
    fn test_hash_changes_with_text() {
        let before = entity_with_text("hello world");
        let after = entity_with_text("hello there");
        assert_ne!(content_hash(&before), content_hash(&after));
    }

    #[test]
    fn test_hash_ignores_timestamp_fields() {
        let mut entity = entity_with_text("hello");
        let baseline = content_hash(&entity);
        entity.common_mut().fields.push(EntityField {
            name: "fetched_at".to_string(),
            value: json!("2024-06-01T00:00:00Z"),
            role: FieldRole::Timestamp,
        });
        assert_eq!(content_hash(&entity), baseline);
    }

    #[test]
    fn test_hash_is_nfc_stable() {
        // U+00E9 vs e + U+0301 combining acute: same text after NFC.
        let composed = entity_with_text("caf\u{e9}");
        let decomposed = entity_with_text("cafe\u{301}");
        assert_eq!(content_hash(&composed), content_hash(&decomposed));
    }

    #[test]
    fn test_field_names_are_lowercased() {
        let mut left = entity_with_text("x");
        left.common_mut().fields = vec![EntityField::metadata("Status", "open")];
        let mut right = entity_with_text("x");
        right.common_mut().fields = vec![EntityField::metadata("status", "open")];
        assert_eq!(content_hash(&left), content_hash(&right));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"d": 2, "c": 3}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    proptest! {
        #[test]
        fn proptest_hash_is_hex_sha1(text in ".*") {
            let digest = content_hash(&entity_with_text(&text));
            prop_assert_eq!(digest.len(), 40);
            prop_assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
