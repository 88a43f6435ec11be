//! Raw documents captured from sources, before any normalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::Domain;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStagedDocument {
    pub platform_name: String,
    pub domain: Domain,
    pub payload: JsonValue,
    pub platform_specific_id: Option<String>,
    pub source_url: Option<String>,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedDocument {
    pub id: i64,
    pub platform_name: String,
    pub domain: Domain,
    pub payload: JsonValue,
    pub platform_specific_id: Option<String>,
    pub source_url: Option<String>,
    pub content_hash: String,
    pub processed: bool,
    pub fetched_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl StagedDocument {
    pub fn from_new(id: i64, new: NewStagedDocument, fetched_at: DateTime<Utc>) -> Self {
        Self {
            id,
            platform_name: new.platform_name,
            domain: new.domain,
            payload: new.payload,
            platform_specific_id: new.platform_specific_id,
            source_url: new.source_url,
            content_hash: new.content_hash,
            processed: false,
            fetched_at,
            processed_at: None,
        }
    }
}

/// Result of a staging submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    pub id: i64,
    /// True when the payload hash was already staged and nothing was written.
    pub deduplicated: bool,
}
