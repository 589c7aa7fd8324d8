//! Core domain model for curbstone: run identifiers and listing records.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "curb-core";

/// Storage prefix label some layouts put in front of a run id.
pub const RUN_ID_LABEL: &str = "run_id=";

/// Fixed column order of the published dataset.
pub const CSV_COLUMNS: [&str; 9] = [
    "post_id",
    "run_id",
    "scraped_at",
    "price",
    "year",
    "make",
    "model",
    "mileage",
    "source_txt",
];

fn compact_re() -> &'static Regex {
    static COMPACT_RE: OnceLock<Regex> = OnceLock::new();
    COMPACT_RE.get_or_init(|| Regex::new(r"^\d{14}$").expect("valid compact run id regex"))
}

fn iso_compact_re() -> &'static Regex {
    static ISO_COMPACT_RE: OnceLock<Regex> = OnceLock::new();
    ISO_COMPACT_RE.get_or_init(|| Regex::new(r"^\d{8}T\d{6}Z$").expect("valid iso run id regex"))
}

/// The two textual encodings a run id may arrive in.
///
/// Within one family, lexicographic order equals chronological order.
/// Comparing across families requires resolving to a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunIdEncoding {
    /// `20251026170002`
    Compact,
    /// `20251026T170002Z`
    IsoCompact,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunIdError {
    #[error("unsupported run id encoding: {0:?}")]
    Unsupported(String),
}

/// A validated scrape-batch identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Accepts exactly the two supported encodings; everything else is rejected.
    pub fn parse(raw: &str) -> Result<Self, RunIdError> {
        match Self::encoding_of(raw) {
            Some(_) => Ok(Self(raw.to_string())),
            None => Err(RunIdError::Unsupported(raw.to_string())),
        }
    }

    /// Parses a storage path segment, stripping an optional `run_id=` label.
    pub fn from_storage_segment(segment: &str) -> Result<Self, RunIdError> {
        Self::parse(segment.strip_prefix(RUN_ID_LABEL).unwrap_or(segment))
    }

    pub fn encoding_of(raw: &str) -> Option<RunIdEncoding> {
        if compact_re().is_match(raw) {
            Some(RunIdEncoding::Compact)
        } else if iso_compact_re().is_match(raw) {
            Some(RunIdEncoding::IsoCompact)
        } else {
            None
        }
    }

    pub fn encoding(&self) -> RunIdEncoding {
        Self::encoding_of(&self.0).expect("RunId is validated on construction")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Strict resolution to a UTC instant.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let format = match self.encoding() {
            RunIdEncoding::Compact => "%Y%m%d%H%M%S",
            RunIdEncoding::IsoCompact => "%Y%m%dT%H%M%SZ",
        };
        NaiveDateTime::parse_from_str(&self.0, format)
            .ok()
            .map(|dt| dt.and_utc())
    }

    /// Resolution with a lossy fallback: a run id that passes the shape check
    /// but names an impossible instant (e.g. month 13) degrades to the
    /// current time rather than failing the caller.
    pub fn timestamp_or_now(&self) -> DateTime<Utc> {
        self.timestamp().unwrap_or_else(|| {
            warn!(run_id = %self.0, "run id did not resolve to an instant, falling back to now");
            Utc::now()
        })
    }

    /// ISO-8601 seconds-precision UTC rendering, always `Z`-suffixed.
    pub fn scraped_at_iso(&self) -> String {
        self.timestamp_or_now()
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional structured fields pulled out of a listing body.
///
/// A field that failed or never matched is absent from the serialized
/// record, not null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage: Option<i64>,
}

/// One structured observation of a single posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub post_id: String,
    /// Backfilled by the materializer when an older record omitted it.
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub scraped_at: String,
    #[serde(default)]
    pub source_txt: String,
    #[serde(flatten)]
    pub fields: ListingFields,
}
