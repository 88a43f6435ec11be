//! Core domain model for the AOD ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;
pub mod extension;
pub mod job;
pub mod staging;

pub use catalog::{
    CanonicalContent, CatalogUpsert, IdentityMatch, MasterRecord, NewTransformRun, PlatformData,
    PlatformRecord, TransformRun, TransformStatus,
};
pub use extension::{
    DomainExtension, DomainPatch, FieldError, FieldKind, FieldValue, GameExtension,
    MovieExtension, TvExtension, WebnovelExtension, WebtoonExtension,
};
pub use job::{
    EnqueueOutcome, Job, JobOutcome, JobStatus, JobType, NewJob, DEFAULT_MAX_RETRIES,
    DEFAULT_PRIORITY,
};
pub use staging::{NewStagedDocument, SaveOutcome, StagedDocument};

pub const CRATE_NAME: &str = "aod-core";

/// Content family a staged document or canonical record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Domain {
    Movie,
    Tv,
    Game,
    Webtoon,
    Webnovel,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Movie,
        Domain::Tv,
        Domain::Game,
        Domain::Webtoon,
        Domain::Webnovel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Movie => "MOVIE",
            Domain::Tv => "TV",
            Domain::Game => "GAME",
            Domain::Webtoon => "WEBTOON",
            Domain::Webnovel => "WEBNOVEL",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown domain `{0}`")]
pub struct UnknownDomain(pub String);

impl FromStr for Domain {
    type Err = UnknownDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == upper)
            .ok_or_else(|| UnknownDomain(s.to_string()))
    }
}
