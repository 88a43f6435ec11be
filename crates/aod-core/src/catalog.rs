//! Canonical catalog records and the transform-run audit trail.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::extension::{parse_date, DomainPatch};
use crate::Domain;

/// Master fields extracted from a document, all optional until validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub master_title: Option<String>,
    pub original_title: Option<String>,
    pub release_year: Option<i32>,
    pub poster_url: Option<String>,
    pub synopsis: Option<String>,
}

impl MasterRecord {
    /// Reads the well-known master keys out of a transformed master document.
    pub fn from_doc(doc: &Map<String, JsonValue>) -> Self {
        let release_year = doc
            .get("release_year")
            .and_then(year_from_value)
            .or_else(|| doc.get("release_date").and_then(year_from_value));
        Self {
            master_title: text(doc.get("master_title")),
            original_title: text(doc.get("original_title")),
            release_year,
            poster_url: text(doc.get("poster_url")).or_else(|| text(doc.get("poster_image_url"))),
            synopsis: text(doc.get("synopsis")),
        }
    }

    /// The trimmed title, if it has any content.
    pub fn title(&self) -> Option<&str> {
        self.master_title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

fn text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn year_from_value(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        JsonValue::String(s) => {
            let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.len() >= 4 {
                digits[..4].parse().ok()
            } else {
                parse_date(s).map(|date| date.year())
            }
        }
        _ => None,
    }
}

/// How well an existing record matches an incoming identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMatch {
    Exact,
    /// Same domain and title, and one side has no release year yet.
    UnknownYear,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalContent {
    pub id: i64,
    pub domain: Domain,
    pub master_title: String,
    pub original_title: Option<String>,
    pub release_year: Option<i32>,
    pub poster_url: Option<String>,
    pub synopsis: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalContent {
    pub fn create(
        id: i64,
        domain: Domain,
        master_title: &str,
        master: &MasterRecord,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            domain,
            master_title: master_title.to_string(),
            original_title: master.original_title.clone(),
            release_year: master.release_year,
            poster_url: master.poster_url.clone(),
            synopsis: master.synopsis.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn identity_match(
        &self,
        domain: Domain,
        master_title: &str,
        release_year: Option<i32>,
    ) -> IdentityMatch {
        if self.domain != domain || self.master_title != master_title {
            IdentityMatch::None
        } else if self.release_year == release_year {
            IdentityMatch::Exact
        } else if self.release_year.is_none() || release_year.is_none() {
            IdentityMatch::UnknownYear
        } else {
            IdentityMatch::None
        }
    }

    /// First-writer-wins enrichment: only null scalars are filled in.
    /// Returns true when anything changed.
    pub fn merge_missing(&mut self, incoming: &MasterRecord, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        changed |= fill(&mut self.original_title, &incoming.original_title);
        changed |= fill(&mut self.release_year, &incoming.release_year);
        changed |= fill(&mut self.poster_url, &incoming.poster_url);
        changed |= fill(&mut self.synopsis, &incoming.synopsis);
        if changed {
            self.updated_at = now;
        }
        changed
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
    if slot.is_none() && incoming.is_some() {
        *slot = incoming.clone();
        true
    } else {
        false
    }
}

/// A platform's own latest view of an item, as produced by a transform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformRecord {
    pub platform_name: String,
    pub platform_specific_id: String,
    pub url: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub attributes: Map<String, JsonValue>,
}

impl PlatformRecord {
    pub fn from_doc(
        platform_name: &str,
        platform_specific_id: String,
        url: Option<String>,
        doc: &Map<String, JsonValue>,
    ) -> Self {
        let rating = doc.get("rating").and_then(|v| match v {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        let review_count = doc
            .get("review_count")
            .or_else(|| doc.get("reviewCount"))
            .and_then(|v| match v {
                JsonValue::Number(n) => n.as_i64(),
                JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
                _ => None,
            });
        let attributes = doc
            .get("attributes")
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_default();
        Self {
            platform_name: platform_name.to_string(),
            platform_specific_id,
            url,
            rating,
            review_count,
            attributes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformData {
    pub id: i64,
    pub content_id: i64,
    pub platform_name: String,
    pub platform_specific_id: String,
    pub url: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub attributes: Map<String, JsonValue>,
    pub last_seen_at: DateTime<Utc>,
}

impl PlatformData {
    pub fn create(id: i64, content_id: i64, record: &PlatformRecord, now: DateTime<Utc>) -> Self {
        Self {
            id,
            content_id,
            platform_name: record.platform_name.clone(),
            platform_specific_id: record.platform_specific_id.clone(),
            url: record.url.clone(),
            rating: record.rating,
            review_count: record.review_count,
            attributes: record.attributes.clone(),
            last_seen_at: now,
        }
    }

    /// Full overwrite of the scalar fields; the attribute bag is unioned with later keys winning.
    pub fn overwrite_from(&mut self, content_id: i64, record: &PlatformRecord, now: DateTime<Utc>) {
        self.content_id = content_id;
        self.url = record.url.clone();
        self.rating = record.rating;
        self.review_count = record.review_count;
        for (key, value) in &record.attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
        self.last_seen_at = now;
    }
}

/// Everything one upsert writes, applied by a catalog store as a single atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogUpsert {
    pub domain: Domain,
    pub master_title: String,
    pub master: MasterRecord,
    pub platform: PlatformRecord,
    pub extension: DomainPatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformStatus {
    Success,
    Failed,
}

impl TransformStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformStatus::Success => "SUCCESS",
            TransformStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransformRun {
    pub staged_document_id: i64,
    pub platform_name: String,
    pub domain: Domain,
    pub rule_path: Option<String>,
    pub status: TransformStatus,
    pub error: Option<String>,
    pub produced_content_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRun {
    pub id: i64,
    pub staged_document_id: i64,
    pub platform_name: String,
    pub domain: Domain,
    pub rule_path: Option<String>,
    pub status: TransformStatus,
    pub error: Option<String>,
    pub produced_content_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TransformRun {
    pub fn from_new(id: i64, new: NewTransformRun) -> Self {
        Self {
            id,
            staged_document_id: new.staged_document_id,
            platform_name: new.platform_name,
            domain: new.domain,
            rule_path: new.rule_path,
            status: new.status,
            error: new.error,
            produced_content_id: new.produced_content_id,
            created_at: new.created_at,
            finished_at: new.finished_at,
        }
    }
}
