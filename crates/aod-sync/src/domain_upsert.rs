//! Turns a transformed domain document into a typed [`DomainPatch`].

use aod_core::extension::parse_date;
use aod_core::{Domain, DomainPatch, FieldError};
use indexmap::IndexMap;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::trace;

use crate::rules::DomainObjectMapping;

pub const FINISHED: &str = "finished";
pub const ONGOING: &str = "ongoing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    Integer,
    Long,
    String,
    Date,
    StringList,
    /// Boolean-ish completion flag rendered as `finished` / `ongoing`.
    CompletionStatus,
    PassThrough,
}

impl TypeHint {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("integer") | Some("int") => TypeHint::Integer,
            Some("long") => TypeHint::Long,
            Some("string") => TypeHint::String,
            Some("date") => TypeHint::Date,
            Some("string_list") => TypeHint::StringList,
            Some("completion_status") => TypeHint::CompletionStatus,
            _ => TypeHint::PassThrough,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CoercionError {
    #[error("cannot coerce `{key}` value {value} with hint {hint:?}")]
    Hint {
        key: String,
        hint: TypeHint,
        value: String,
    },
    #[error(transparent)]
    Field(#[from] FieldError),
}

/// Applies a type hint before the value reaches the extension's own field table.
pub fn coerce(key: &str, hint: TypeHint, value: &JsonValue) -> Result<JsonValue, CoercionError> {
    let failed = || CoercionError::Hint {
        key: key.to_string(),
        hint,
        value: value.to_string(),
    };
    let coerced = match hint {
        TypeHint::PassThrough => value.clone(),
        TypeHint::Integer => {
            let n = as_integer(value).ok_or_else(failed)?;
            JsonValue::from(i32::try_from(n).map_err(|_| failed())?)
        }
        TypeHint::Long => JsonValue::from(as_integer(value).ok_or_else(failed)?),
        TypeHint::String => match value {
            JsonValue::String(_) => value.clone(),
            JsonValue::Number(n) => JsonValue::String(n.to_string()),
            JsonValue::Bool(b) => JsonValue::String(b.to_string()),
            JsonValue::Array(items) => {
                let parts = items
                    .iter()
                    .map(|item| item.as_str().map(str::trim))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(failed)?;
                JsonValue::String(parts.join(", "))
            }
            _ => return Err(failed()),
        },
        TypeHint::Date => {
            let raw = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Number(n) => n.to_string(),
                _ => return Err(failed()),
            };
            let date = parse_date(&raw).ok_or_else(failed)?;
            JsonValue::String(date.format("%Y-%m-%d").to_string())
        }
        TypeHint::StringList => match value {
            JsonValue::Array(_) => value.clone(),
            JsonValue::String(s) => JsonValue::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| JsonValue::String(part.to_string()))
                    .collect(),
            ),
            _ => return Err(failed()),
        },
        TypeHint::CompletionStatus => {
            let done = match value {
                JsonValue::Bool(b) => *b,
                JsonValue::String(s) => matches!(
                    s.trim().to_ascii_lowercase().as_str(),
                    "true" | "y" | "yes" | "1" | "finished" | "completed" | "완결"
                ),
                JsonValue::Number(n) => n.as_i64() == Some(1),
                _ => return Err(failed()),
            };
            JsonValue::String(if done { FINISHED } else { ONGOING }.to_string())
        }
    };
    Ok(coerced)
}

fn as_integer(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GenericDomainUpserter;

impl GenericDomainUpserter {
    /// Keys without a mapping and null values are skipped. A mapping that targets a field
    /// the domain shape lacks, or a value that fails coercion, rejects the whole patch.
    pub fn build_patch(
        &self,
        domain: Domain,
        domain_doc: &Map<String, JsonValue>,
        mappings: &IndexMap<String, DomainObjectMapping>,
    ) -> Result<DomainPatch, CoercionError> {
        let mut patch = DomainPatch::new(domain);
        for (key, value) in domain_doc {
            let Some(mapping) = mappings.get(key) else {
                trace!(key, "unmapped domain key ignored");
                continue;
            };
            if value.is_null() {
                continue;
            }
            let hint = TypeHint::parse(mapping.type_hint.as_deref());
            let coerced = coerce(key, hint, value)?;
            patch.push_json(&mapping.target_field, &coerced)?;
        }
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aod_core::FieldValue;
    use chrono::NaiveDate;
    use serde_json::json;

    fn mapping(target: &str, hint: Option<&str>) -> DomainObjectMapping {
        DomainObjectMapping {
            target_field: target.to_string(),
            type_hint: hint.map(str::to_string),
        }
    }

    #[test]
    fn completion_status_reads_boolean_ish_values() {
        for raw in [json!(true), json!("TRUE"), json!("완결"), json!(1)] {
            assert_eq!(
                coerce("finished", TypeHint::CompletionStatus, &raw).unwrap(),
                json!(FINISHED)
            );
        }
        assert_eq!(
            coerce("finished", TypeHint::CompletionStatus, &json!("false")).unwrap(),
            json!(ONGOING)
        );
    }

    #[test]
    fn unknown_hint_passes_through() {
        assert_eq!(TypeHint::parse(Some("webtoon_status")), TypeHint::PassThrough);
        assert_eq!(TypeHint::parse(None), TypeHint::PassThrough);
        let value = json!({"nested": [1]});
        assert_eq!(coerce("k", TypeHint::PassThrough, &value).unwrap(), value);
    }

    #[test]
    fn builds_a_typed_patch_and_ignores_unmapped_keys() {
        let mappings = IndexMap::from([
            ("writer".to_string(), mapping("author", Some("string"))),
            ("finished".to_string(), mapping("status", Some("completion_status"))),
            ("days".to_string(), mapping("weekdays", Some("string_list"))),
            ("start".to_string(), mapping("started_at", Some("date"))),
        ]);
        let doc = json!({
            "writer": "Kim",
            "finished": false,
            "days": "MON, THU",
            "start": "2019.07.04",
            "likes": 120,
            "illustrator": null
        });

        let patch = GenericDomainUpserter
            .build_patch(Domain::Webtoon, doc.as_object().unwrap(), &mappings)
            .unwrap();

        let fields: Vec<(&str, &FieldValue)> =
            patch.fields.iter().map(|(k, v)| (k.as_str(), v)).collect();
        assert_eq!(fields.len(), 4);
        assert!(fields.contains(&("author", &FieldValue::Text("Kim".into()))));
        assert!(fields.contains(&("status", &FieldValue::Text(ONGOING.into()))));
        assert!(fields.contains(&(
            "weekdays",
            &FieldValue::TextList(vec!["MON".into(), "THU".into()])
        )));
        assert!(fields.contains(&(
            "started_at",
            &FieldValue::Date(NaiveDate::from_ymd_opt(2019, 7, 4).unwrap())
        )));
    }

    #[test]
    fn mapping_to_a_missing_field_is_an_error() {
        let mappings = IndexMap::from([("runtime".to_string(), mapping("runtime_min", None))]);
        let doc = json!({"runtime": 120});
        let err = GenericDomainUpserter
            .build_patch(Domain::Game, doc.as_object().unwrap(), &mappings)
            .unwrap_err();
        assert!(matches!(
            err,
            CoercionError::Field(FieldError::UnknownField { domain: Domain::Game, .. })
        ));
    }

    #[test]
    fn integer_hint_failure_is_reported() {
        let mappings =
            IndexMap::from([("seasons".to_string(), mapping("season_count", Some("integer")))]);
        let doc = json!({"seasons": "several"});
        let err = GenericDomainUpserter
            .build_patch(Domain::Tv, doc.as_object().unwrap(), &mappings)
            .unwrap_err();
        assert!(err.to_string().contains("seasons"));
    }
}
