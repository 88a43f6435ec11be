//! Domain-specific extension records, one shape per [`Domain`].
//!
//! Each shape exposes a static field table so values can be assigned by name without
//! reflection: callers look up a [`FieldKind`], coerce the raw JSON into a [`FieldValue`],
//! and hand the value to the shape's setter.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::Domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Date,
    TextList,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Date(NaiveDate),
    TextList(Vec<String>),
    Json(JsonValue),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FieldError {
    #[error("{domain} extension has no field `{field}`")]
    UnknownField { domain: Domain, field: String },
    #[error("field `{field}` expects {expected:?}, got {value}")]
    Coercion {
        field: String,
        expected: FieldKind,
        value: String,
    },
}

impl FieldValue {
    /// Converts a raw JSON value into the representation a field of `kind` stores.
    pub fn from_json(field: &str, kind: FieldKind, value: &JsonValue) -> Result<Self, FieldError> {
        let mismatch = || FieldError::Coercion {
            field: field.to_string(),
            expected: kind,
            value: value.to_string(),
        };
        match kind {
            FieldKind::Json => Ok(FieldValue::Json(value.clone())),
            FieldKind::Text => match value {
                JsonValue::String(s) => Ok(FieldValue::Text(s.clone())),
                JsonValue::Number(n) => Ok(FieldValue::Text(n.to_string())),
                JsonValue::Bool(b) => Ok(FieldValue::Text(b.to_string())),
                _ => Err(mismatch()),
            },
            FieldKind::Integer => integer_from_json(value)
                .map(FieldValue::Integer)
                .ok_or_else(mismatch),
            FieldKind::Date => match value {
                JsonValue::String(s) => parse_date(s).map(FieldValue::Date).ok_or_else(mismatch),
                JsonValue::Number(n) => n
                    .as_i64()
                    .and_then(|y| i32::try_from(y).ok())
                    .and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1))
                    .map(FieldValue::Date)
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            FieldKind::TextList => match value {
                JsonValue::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        JsonValue::String(s) => Some(s.trim().to_string()),
                        JsonValue::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>()
                    .map(FieldValue::TextList)
                    .ok_or_else(mismatch),
                JsonValue::String(s) => Ok(FieldValue::TextList(
                    s.split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(str::to_string)
                        .collect(),
                )),
                _ => Err(mismatch()),
            },
        }
    }
}

fn integer_from_json(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d", "%b %d, %Y", "%Y년 %m월 %d일"];

/// Parses the date spellings sources commonly emit. A bare year maps to January 1st.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim().trim_end_matches('.');
    if raw.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    if let Ok(stamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(stamp.date_naive());
    }
    if raw.len() == 4 && raw.chars().all(|c| c.is_ascii_digit()) {
        return raw.parse().ok().and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1));
    }
    None
}

fn expect_text(field: &str, value: FieldValue) -> Result<String, FieldError> {
    match value {
        FieldValue::Text(s) => Ok(s),
        other => Err(wrong_kind(field, FieldKind::Text, &other)),
    }
}

fn expect_i32(field: &str, value: FieldValue) -> Result<i32, FieldError> {
    match value {
        FieldValue::Integer(n) => i32::try_from(n).map_err(|_| FieldError::Coercion {
            field: field.to_string(),
            expected: FieldKind::Integer,
            value: n.to_string(),
        }),
        other => Err(wrong_kind(field, FieldKind::Integer, &other)),
    }
}

fn expect_date(field: &str, value: FieldValue) -> Result<NaiveDate, FieldError> {
    match value {
        FieldValue::Date(d) => Ok(d),
        other => Err(wrong_kind(field, FieldKind::Date, &other)),
    }
}

fn expect_list(field: &str, value: FieldValue) -> Result<Vec<String>, FieldError> {
    match value {
        FieldValue::TextList(items) => Ok(items),
        other => Err(wrong_kind(field, FieldKind::TextList, &other)),
    }
}

fn expect_json(field: &str, value: FieldValue) -> Result<JsonValue, FieldError> {
    match value {
        FieldValue::Json(v) => Ok(v),
        other => Err(wrong_kind(field, FieldKind::Json, &other)),
    }
}

fn wrong_kind(field: &str, expected: FieldKind, value: &FieldValue) -> FieldError {
    FieldError::Coercion {
        field: field.to_string(),
        expected,
        value: serde_json::to_string(value).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovieExtension {
    pub release_date: Option<NaiveDate>,
    pub runtime_min: Option<i32>,
    pub genres: Vec<String>,
    pub directors: Vec<String>,
    pub cast_members: Vec<String>,
}

impl MovieExtension {
    pub const FIELDS: &'static [(&'static str, FieldKind)] = &[
        ("release_date", FieldKind::Date),
        ("runtime_min", FieldKind::Integer),
        ("genres", FieldKind::TextList),
        ("directors", FieldKind::TextList),
        ("cast_members", FieldKind::TextList),
    ];

    fn set(&mut self, field: &str, value: FieldValue) -> Result<bool, FieldError> {
        match field {
            "release_date" => self.release_date = Some(expect_date(field, value)?),
            "runtime_min" => self.runtime_min = Some(expect_i32(field, value)?),
            "genres" => self.genres = expect_list(field, value)?,
            "directors" => self.directors = expect_list(field, value)?,
            "cast_members" => self.cast_members = expect_list(field, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TvExtension {
    pub first_air_date: Option<NaiveDate>,
    pub season_count: Option<i32>,
    pub episode_runtime: Option<i32>,
    pub genres: Vec<String>,
    pub cast_members: Vec<String>,
}

impl TvExtension {
    pub const FIELDS: &'static [(&'static str, FieldKind)] = &[
        ("first_air_date", FieldKind::Date),
        ("season_count", FieldKind::Integer),
        ("episode_runtime", FieldKind::Integer),
        ("genres", FieldKind::TextList),
        ("cast_members", FieldKind::TextList),
    ];

    fn set(&mut self, field: &str, value: FieldValue) -> Result<bool, FieldError> {
        match field {
            "first_air_date" => self.first_air_date = Some(expect_date(field, value)?),
            "season_count" => self.season_count = Some(expect_i32(field, value)?),
            "episode_runtime" => self.episode_runtime = Some(expect_i32(field, value)?),
            "genres" => self.genres = expect_list(field, value)?,
            "cast_members" => self.cast_members = expect_list(field, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameExtension {
    pub developer: Option<String>,
    pub publisher: Option<String>,
    pub release_date: Option<NaiveDate>,
    /// Per-platform availability, e.g. `{"windows": true, "mac": false}`.
    pub platforms: Option<JsonValue>,
    pub genres: Vec<String>,
}

impl GameExtension {
    pub const FIELDS: &'static [(&'static str, FieldKind)] = &[
        ("developer", FieldKind::Text),
        ("publisher", FieldKind::Text),
        ("release_date", FieldKind::Date),
        ("platforms", FieldKind::Json),
        ("genres", FieldKind::TextList),
    ];

    fn set(&mut self, field: &str, value: FieldValue) -> Result<bool, FieldError> {
        match field {
            "developer" => self.developer = Some(expect_text(field, value)?),
            "publisher" => self.publisher = Some(expect_text(field, value)?),
            "release_date" => self.release_date = Some(expect_date(field, value)?),
            "platforms" => self.platforms = Some(expect_json(field, value)?),
            "genres" => self.genres = expect_list(field, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebtoonExtension {
    pub author: Option<String>,
    pub illustrator: Option<String>,
    pub status: Option<String>,
    pub started_at: Option<NaiveDate>,
    pub weekdays: Vec<String>,
    pub genres: Vec<String>,
}

impl WebtoonExtension {
    pub const FIELDS: &'static [(&'static str, FieldKind)] = &[
        ("author", FieldKind::Text),
        ("illustrator", FieldKind::Text),
        ("status", FieldKind::Text),
        ("started_at", FieldKind::Date),
        ("weekdays", FieldKind::TextList),
        ("genres", FieldKind::TextList),
    ];

    fn set(&mut self, field: &str, value: FieldValue) -> Result<bool, FieldError> {
        match field {
            "author" => self.author = Some(expect_text(field, value)?),
            "illustrator" => self.illustrator = Some(expect_text(field, value)?),
            "status" => self.status = Some(expect_text(field, value)?),
            "started_at" => self.started_at = Some(expect_date(field, value)?),
            "weekdays" => self.weekdays = expect_list(field, value)?,
            "genres" => self.genres = expect_list(field, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebnovelExtension {
    pub author: Option<String>,
    pub translator: Option<String>,
    pub status: Option<String>,
    pub started_at: Option<NaiveDate>,
    pub genres: Vec<String>,
}

impl WebnovelExtension {
    pub const FIELDS: &'static [(&'static str, FieldKind)] = &[
        ("author", FieldKind::Text),
        ("translator", FieldKind::Text),
        ("status", FieldKind::Text),
        ("started_at", FieldKind::Date),
        ("genres", FieldKind::TextList),
    ];

    fn set(&mut self, field: &str, value: FieldValue) -> Result<bool, FieldError> {
        match field {
            "author" => self.author = Some(expect_text(field, value)?),
            "translator" => self.translator = Some(expect_text(field, value)?),
            "status" => self.status = Some(expect_text(field, value)?),
            "started_at" => self.started_at = Some(expect_date(field, value)?),
            "genres" => self.genres = expect_list(field, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// The per-domain extension attached 1:1 to a canonical content record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainExtension {
    Movie(MovieExtension),
    Tv(TvExtension),
    Game(GameExtension),
    Webtoon(WebtoonExtension),
    Webnovel(WebnovelExtension),
}

impl DomainExtension {
    pub fn empty(domain: Domain) -> Self {
        match domain {
            Domain::Movie => DomainExtension::Movie(MovieExtension::default()),
            Domain::Tv => DomainExtension::Tv(TvExtension::default()),
            Domain::Game => DomainExtension::Game(GameExtension::default()),
            Domain::Webtoon => DomainExtension::Webtoon(WebtoonExtension::default()),
            Domain::Webnovel => DomainExtension::Webnovel(WebnovelExtension::default()),
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            DomainExtension::Movie(_) => Domain::Movie,
            DomainExtension::Tv(_) => Domain::Tv,
            DomainExtension::Game(_) => Domain::Game,
            DomainExtension::Webtoon(_) => Domain::Webtoon,
            DomainExtension::Webnovel(_) => Domain::Webnovel,
        }
    }

    pub fn fields(domain: Domain) -> &'static [(&'static str, FieldKind)] {
        match domain {
            Domain::Movie => MovieExtension::FIELDS,
            Domain::Tv => TvExtension::FIELDS,
            Domain::Game => GameExtension::FIELDS,
            Domain::Webtoon => WebtoonExtension::FIELDS,
            Domain::Webnovel => WebnovelExtension::FIELDS,
        }
    }

    pub fn field_kind(domain: Domain, field: &str) -> Result<FieldKind, FieldError> {
        Self::fields(domain)
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| FieldError::UnknownField {
                domain,
                field: field.to_string(),
            })
    }

    pub fn set_field(&mut self, field: &str, value: FieldValue) -> Result<(), FieldError> {
        let known = match self {
            DomainExtension::Movie(ext) => ext.set(field, value)?,
            DomainExtension::Tv(ext) => ext.set(field, value)?,
            DomainExtension::Game(ext) => ext.set(field, value)?,
            DomainExtension::Webtoon(ext) => ext.set(field, value)?,
            DomainExtension::Webnovel(ext) => ext.set(field, value)?,
        };
        if known {
            Ok(())
        } else {
            Err(FieldError::UnknownField {
                domain: self.domain(),
                field: field.to_string(),
            })
        }
    }

    /// Applies every value of a patch; the latest source wins for each assigned field.
    pub fn apply(&mut self, patch: &DomainPatch) -> Result<(), FieldError> {
        for (field, value) in &patch.fields {
            self.set_field(field, value.clone())?;
        }
        Ok(())
    }
}

/// Typed field assignments for one extension, validated against its field table.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainPatch {
    pub domain: Domain,
    pub fields: Vec<(String, FieldValue)>,
}

impl DomainPatch {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            fields: Vec::new(),
        }
    }

    /// Coerces `value` to the field's kind and queues the assignment.
    pub fn push_json(&mut self, field: &str, value: &JsonValue) -> Result<(), FieldError> {
        let kind = DomainExtension::field_kind(self.domain, field)?;
        let value = FieldValue::from_json(field, kind, value)?;
        self.fields.push((field.to_string(), value));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
