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

//! Translates plan filter groups into YQL WHERE clauses.
//!
//! Groups are OR-ed together; conditions within a group are AND-ed, allowing
//! `(A AND B) OR (C AND D)`. Logical field names are mapped to the stored
//! index paths, and datetime strings on epoch fields become epoch seconds.

use serde_json::Value as JsonValue;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::plan::{FilterCondition, FilterGroup, FilterOperator};

/// Logical field name → stored index path.
const FIELD_NAME_MAP: &[(&str, &str)] = &[
    ("collection_id", "weft_system_metadata_collection_id"),
    ("entity_type", "weft_system_metadata_entity_type"),
    ("sync_id", "weft_system_metadata_sync_id"),
    ("content_hash", "weft_system_metadata_hash"),
    ("hash", "weft_system_metadata_hash"),
    ("original_entity_id", "weft_system_metadata_original_entity_id"),
    ("source_name", "weft_system_metadata_source_name"),
    ("chunk_index", "weft_system_metadata_chunk_index"),
    ("access_is_public", "access_is_public"),
    ("access_viewers", "access_viewers"),
];

/// Fields stored as epoch seconds in the index.
const EPOCH_FIELDS: &[&str] = &["created_at", "updated_at"];

#[derive(Default)]
pub struct FilterTranslator;

impl FilterTranslator {
    pub fn new() -> Self {
        Self
    }

    /// Returns the YQL clause for the groups, or `None` when there are no
    /// translatable filters.
    pub fn translate(&self, filter_groups: &[FilterGroup]) -> Option<String> {
        if filter_groups.is_empty() {
            return None;
        }
        let group_clauses: Vec<String> = filter_groups
            .iter()
            .filter_map(|group| self.translate_group(group))
            .map(|clause| format!("({clause})"))
            .collect();
        if group_clauses.is_empty() {
            return None;
        }
        if group_clauses.len() == 1 {
            Some(group_clauses.into_iter().next().unwrap_or_default())
        } else {
            Some(group_clauses.join(" OR "))
        }
    }

    fn translate_group(&self, group: &FilterGroup) -> Option<String> {
        let condition_clauses: Vec<String> = group
            .conditions
            .iter()
            .filter_map(|condition| self.translate_condition(condition))
            .collect();
        if condition_clauses.is_empty() {
            return None;
        }
        Some(condition_clauses.join(" AND "))
    }

    fn translate_condition(&self, condition: &FilterCondition) -> Option<String> {
        let field = map_field_name(&condition.field);
        let value = if EPOCH_FIELDS.contains(&condition.field.as_str()) {
            convert_datetime_to_epoch(&condition.value)
        } else {
            condition.value.clone()
        };
        match condition.operator {
            FilterOperator::Gt => Some(format!("{field} > {}", format_value(&value))),
            FilterOperator::Lt => Some(format!("{field} < {}", format_value(&value))),
            FilterOperator::Ge => Some(format!("{field} >= {}", format_value(&value))),
            FilterOperator::Le => Some(format!("{field} <= {}", format_value(&value))),
            FilterOperator::Eq => Some(build_equals(&field, &value)),
            FilterOperator::Ne => Some(build_not_equals(&field, &value)),
            FilterOperator::Contains => Some(build_contains(&field, &value)),
            FilterOperator::In => Some(build_in(&field, &value)),
            FilterOperator::NotIn => Some(build_not_in(&field, &value)),
        }
    }
}

fn map_field_name(field: &str) -> String {
    FIELD_NAME_MAP
        .iter()
        .find(|(logical, _)| *logical == field)
        .map(|(_, stored)| stored.to_string())
        .unwrap_or_else(|| field.to_string())
}

fn build_equals(field: &str, value: &JsonValue) -> String {
    match value {
        JsonValue::String(string) => format!("{field} contains \"{}\"", escape(string)),
        JsonValue::Bool(boolean) => format!("{field} = {boolean}"),
        other => format!("{field} = {other}"),
    }
}

fn build_not_equals(field: &str, value: &JsonValue) -> String {
    match value {
        JsonValue::String(string) => format!("!({field} contains \"{}\")", escape(string)),
        JsonValue::Bool(boolean) => format!("{field} != {boolean}"),
        other => format!("{field} != {other}"),
    }
}

fn build_contains(field: &str, value: &JsonValue) -> String {
    let text = match value {
        JsonValue::String(string) => string.clone(),
        other => other.to_string(),
    };
    format!("{field} contains \"{}\"", escape(&text))
}

fn build_in(field: &str, value: &JsonValue) -> String {
    let Some(values) = value.as_array().filter(|values| !values.is_empty()) else {
        // An empty IN list matches nothing.
        return "false".to_string();
    };
    let clauses: Vec<String> = values
        .iter()
        .map(|item| build_contains(field, item))
        .collect();
    format!("({})", clauses.join(" OR "))
}

fn build_not_in(field: &str, value: &JsonValue) -> String {
    let Some(values) = value.as_array().filter(|values| !values.is_empty()) else {
        // An empty NOT IN list matches everything.
        return "true".to_string();
    };
    let clauses: Vec<String> = values
        .iter()
        .map(|item| format!("!({})", build_contains(field, item)))
        .collect();
    format!("({})", clauses.join(" AND "))
}

fn format_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(string) => format!("\"{}\"", escape(string)),
        JsonValue::Bool(boolean) => boolean.to_string(),
        other => other.to_string(),
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn convert_datetime_to_epoch(value: &JsonValue) -> JsonValue {
    let Some(raw) = value.as_str() else {
        return value.clone();
    };
    match OffsetDateTime::parse(raw, &Rfc3339) {
        Ok(datetime) => JsonValue::from(datetime.unix_timestamp()),
        Err(error) => {
            warn!(value = raw, %error, "failed to parse datetime filter value");
            value.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn condition(field: &str, operator: FilterOperator, value: JsonValue) -> FilterCondition {
        FilterCondition {
            field: field.to_string(),
            operator,
            value,
        }
    }

    fn group(conditions: Vec<FilterCondition>) -> FilterGroup {
        FilterGroup { conditions }
    }

    #[test]
    fn test_no_filters_translate_to_none() {
        let translator = FilterTranslator::new();
        assert_eq!(translator.translate(&[]), None);
        assert_eq!(translator.translate(&[group(vec![])]), None);
    }

    #[test]
    fn test_string_equals_uses_contains() {
        let translator = FilterTranslator::new();
        let yql = translator
            .translate(&[group(vec![condition(
                "source_name",
                FilterOperator::Eq,
                json!("slack"),
            )])])
            .unwrap();
        assert_eq!(yql, "(weft_system_metadata_source_name contains \"slack\")");
    }

    #[test]
    fn test_numeric_and_bool_equals() {
        let translator = FilterTranslator::new();
        let yql = translator
            .translate(&[group(vec![
                condition("chunk_index", FilterOperator::Eq, json!(3)),
                condition("access_is_public", FilterOperator::Eq, json!(true)),
            ])])
            .unwrap();
        assert_eq!(
            yql,
            "(weft_system_metadata_chunk_index = 3 AND access_is_public = true)"
        );
    }

    #[test]
    fn test_groups_or_conditions_and() {
        let translator = FilterTranslator::new();
        let yql = translator
            .translate(&[
                group(vec![
                    condition("source_name", FilterOperator::Eq, json!("slack")),
                    condition("chunk_index", FilterOperator::Gt, json!(0)),
                ]),
                group(vec![condition("source_name", FilterOperator::Eq, json!("jira"))]),
            ])
            .unwrap();
        assert_eq!(
            yql,
            "(weft_system_metadata_source_name contains \"slack\" AND \
             weft_system_metadata_chunk_index > 0) OR \
             (weft_system_metadata_source_name contains \"jira\")"
        );
    }

    #[test]
    fn test_in_and_not_in_expand_to_boolean_combinations() {
        let translator = FilterTranslator::new();
        let yql = translator
            .translate(&[group(vec![condition(
                "entity_type",
                FilterOperator::In,
                json!(["slack.message", "slack.channel"]),
            )])])
            .unwrap();
        assert_eq!(
            yql,
            "((weft_system_metadata_entity_type contains \"slack.message\" OR \
             weft_system_metadata_entity_type contains \"slack.channel\"))"
        );

        let yql = translator
            .translate(&[group(vec![condition(
                "entity_type",
                FilterOperator::NotIn,
                json!(["slack.message"]),
            )])])
            .unwrap();
        assert_eq!(
            yql,
            "((!(weft_system_metadata_entity_type contains \"slack.message\")))"
        );
    }

    #[test]
    fn test_empty_in_matches_nothing_and_empty_not_in_everything() {
        let translator = FilterTranslator::new();
        let yql = translator
            .translate(&[group(vec![condition("entity_type", FilterOperator::In, json!([]))])])
            .unwrap();
        assert_eq!(yql, "(false)");
        let yql = translator
            .translate(&[group(vec![condition(
                "entity_type",
                FilterOperator::NotIn,
                json!([]),
            )])])
            .unwrap();
        assert_eq!(yql, "(true)");
    }

    #[test]
    fn test_string_values_are_escaped() {
        let translator = FilterTranslator::new();
        let yql = translator
            .translate(&[group(vec![condition(
                "name",
                FilterOperator::Eq,
                json!("say \"hi\" \\ bye"),
            )])])
            .unwrap();
        assert_eq!(yql, "(name contains \"say \\\"hi\\\" \\\\ bye\")");
    }

    #[test]
    fn test_epoch_fields_convert_rfc3339_to_seconds() {
        let translator = FilterTranslator::new();
        let yql = translator
            .translate(&[group(vec![condition(
                "updated_at",
                FilterOperator::Ge,
                json!("2024-01-01T00:00:00Z"),
            )])])
            .unwrap();
        assert_eq!(yql, "(updated_at >= 1704067200)");
    }

    #[test]
    fn test_unknown_fields_pass_through_unmapped() {
        let translator = FilterTranslator::new();
        let yql = translator
            .translate(&[group(vec![condition(
                "custom_field",
                FilterOperator::Contains,
                json!("x"),
            )])])
            .unwrap();
        assert_eq!(yql, "(custom_field contains \"x\")");
    }
}
