//! Core domain model for job search runs.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jfind-core";

/// Placeholder stored when a listing's detail page could not be read.
pub const DESCRIPTION_UNAVAILABLE: &str = "Description not available";

/// One scraped job posting. Never mutated after extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub title: String,
    pub link: String,
    pub description: String,
}

impl ListingRecord {
    pub fn new(title: impl Into<String>, link: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            description: description.into(),
        }
    }

    pub fn unavailable(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self::new(title, link, DESCRIPTION_UNAVAILABLE)
    }

    pub fn has_description(&self) -> bool {
        self.description != DESCRIPTION_UNAVAILABLE
    }
}

/// The user's skill list: the raw comma-separated text plus its normalized entries.
///
/// Entries are trimmed and lowercased, order and duplicates are preserved.
/// Blank fragments are dropped because an empty needle matches any text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SkillProfile {
    raw: String,
    skills: Vec<String>,
}

impl SkillProfile {
    pub fn parse(input: &str) -> Self {
        let skills = input
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            raw: input.to_string(),
            skills,
        }
    }

    pub fn from_skills<I, S>(skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = skills
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self::parse(&joined)
    }

    /// The text as the user typed it; used as the profile document for similarity.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn skills(&self) -> &[String] {
        &self.skills
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

/// A listing paired with its relevance against a [`SkillProfile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredListing {
    pub page: u32,
    #[serde(flatten)]
    pub record: ListingRecord,
    pub found_skills: BTreeSet<String>,
    pub matching_percentage: f64,
}

impl ScoredListing {
    pub fn new(page: u32, record: ListingRecord, found_skills: BTreeSet<String>, matching_percentage: f64) -> Self {
        debug_assert!(
            matching_percentage <= 0.0 || !found_skills.is_empty(),
            "positive score requires at least one found skill"
        );
        Self {
            page,
            record,
            found_skills,
            matching_percentage,
        }
    }

    pub fn found_skills_text(&self) -> String {
        self.found_skills.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("page numbers start at 1 (got start={start}, end={end})")]
    ZeroPage { start: u32, end: u32 },
    #[error("start page {start} is after end page {end}")]
    Inverted { start: u32, end: u32 },
}

/// Inclusive, 1-based range of results pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    start: u32,
    end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Result<Self, RangeError> {
        if start == 0 || end == 0 {
            return Err(RangeError::ZeroPage { start, end });
        }
        if start > end {
            return Err(RangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn pages(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Identity of a single search run, shared by persistence and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: Uuid,
    pub query: String,
    pub range: PageRange,
    pub started_at: DateTime<Utc>,
}

impl RunMeta {
    pub fn new(query: impl Into<String>, range: PageRange) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            query: query.into(),
            range,
            started_at: Utc::now(),
        }
    }
}
