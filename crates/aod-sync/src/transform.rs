//! Rule-driven mapping of a raw staged payload into master, platform and domain documents.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use tracing::trace;

use crate::rules::{MappingRule, NormalizerStep};

static PARENTHESES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\([^)]*\)").expect("static parentheses regex"));
static WHITESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("static whitespace regex"));

pub const PLATFORM_NAME_KEY: &str = "platformName";
pub const PLATFORM_ID_KEY: &str = "platformSpecificId";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    pub master: Map<String, JsonValue>,
    pub platform: Map<String, JsonValue>,
    pub domain: Map<String, JsonValue>,
}

impl TransformOutput {
    pub fn platform_attributes(&self) -> Option<&Map<String, JsonValue>> {
        self.platform.get("attributes").and_then(JsonValue::as_object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination<'a> {
    PlatformAttribute(&'a str),
    Platform(&'a str),
    Domain(&'a str),
    Master(&'a str),
}

impl<'a> Destination<'a> {
    fn parse(raw: &'a str) -> Self {
        if let Some(key) = raw.strip_prefix("platform.attributes.") {
            Destination::PlatformAttribute(key)
        } else if let Some(field) = raw.strip_prefix("platform.") {
            Destination::Platform(field)
        } else if let Some(key) = raw.strip_prefix("domain.") {
            Destination::Domain(key)
        } else {
            Destination::Master(raw)
        }
    }
}

/// Walks a dot-separated path through nested objects. Missing and null both yield `None`.
pub fn deep_get<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    (!current.is_null()).then_some(current)
}

pub fn apply_normalizer(kind: &str, value: &str) -> Option<String> {
    match kind {
        "lowercase" => Some(value.to_lowercase()),
        "strip_parentheses" => Some(PARENTHESES_RE.replace_all(value, "").into_owned()),
        "collapse_spaces" => Some(WHITESPACE_RE.replace_all(value, " ").trim().to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransformEngine;

impl TransformEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn transform(&self, payload: &JsonValue, rule: &MappingRule) -> TransformOutput {
        let mut out = TransformOutput::default();
        let mut attributes = Map::new();

        for (source_path, destination) in &rule.field_mappings {
            let Some(value) = deep_get(payload, source_path) else {
                trace!(source_path, "mapping source absent");
                continue;
            };
            let value = value.clone();
            match Destination::parse(destination) {
                Destination::PlatformAttribute(key) => {
                    attributes.insert(key.to_string(), value);
                }
                Destination::Platform(field) => {
                    out.platform.insert(field.to_string(), value);
                }
                Destination::Domain(key) => {
                    out.domain.insert(key.to_string(), value);
                }
                Destination::Master(field) => {
                    out.master.insert(field.to_string(), value);
                }
            }
        }

        for step in &rule.normalizers {
            normalize_master(&mut out.master, step);
        }

        if !attributes.is_empty() {
            out.platform
                .insert("attributes".to_string(), JsonValue::Object(attributes));
        }
        out.platform.insert(
            PLATFORM_NAME_KEY.to_string(),
            JsonValue::String(rule.platform_name.clone()),
        );
        out
    }
}

fn normalize_master(master: &mut Map<String, JsonValue>, step: &NormalizerStep) {
    for field in &step.fields {
        if let Some(JsonValue::String(current)) = master.get_mut(field) {
            match apply_normalizer(&step.kind, current) {
                Some(normalized) => *current = normalized,
                None => {
                    trace!(normalizer = %step.kind, "unknown normalizer ignored");
                    return;
                }
            }
        }
    }
}
