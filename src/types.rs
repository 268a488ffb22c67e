use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Which parse stage produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    /// Bounded head + tail read. Authoritative only for identity, timestamps and size.
    Fast,
    /// Every line decoded. Counts are authoritative.
    Enriched,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    pub user: u32,
    pub assistant: u32,
    pub system: u32,
    pub other: u32,
}

impl RoleCounts {
    pub fn record(&mut self, role: &str) {
        match role {
            "user" => self.user += 1,
            "assistant" => self.assistant += 1,
            "system" | "developer" => self.system += 1,
            _ => self.other += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.user + self.assistant + self.system + self.other
    }

    /// True when every per-role count is at least the one in `other`.
    pub fn dominates(&self, other: &RoleCounts) -> bool {
        self.user >= other.user
            && self.assistant >= other.assistant
            && self.system >= other.system
            && self.other >= other.other
    }
}

/// One parsed transcript file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last decoded event line, if any line carried one.
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
    pub cwd: Option<String>,
    pub cli_version: Option<String>,
    pub instructions: Option<String>,
    pub model: Option<String>,
    /// First user prompt, trimmed for list display.
    pub title: Option<String>,
    pub role_counts: RoleCounts,
    pub tool_invocations: u32,
    pub total_events: u64,
    pub total_lines: u64,
    pub source: Option<String>,
    pub completeness: Completeness,
}

impl SessionRecord {
    pub fn is_enriched(&self) -> bool {
        self.completeness == Completeness::Enriched
    }

    /// Wall-clock span between creation and the last update, never negative.
    pub fn duration(&self) -> Duration {
        let span = self.last_updated_at - self.created_at;
        if span < Duration::zero() {
            Duration::zero()
        } else {
            span
        }
    }

    pub fn timestamp_for(&self, dimension: DateDimension) -> DateTime<Utc> {
        match dimension {
            DateDimension::Created => self.created_at,
            DateDimension::Updated => self.last_updated_at,
        }
    }

    pub fn date_for(&self, dimension: DateDimension, zone: DayZone) -> NaiveDate {
        zone.date_of(self.timestamp_for(dimension))
    }
}

/// Which timestamp drives day bucketing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateDimension {
    #[default]
    Created,
    Updated,
}

impl FromStr for DateDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(DateDimension::Created),
            "updated" => Ok(DateDimension::Updated),
            other => Err(format!("unknown date dimension: {other}")),
        }
    }
}

/// Time zone used to turn timestamps into calendar days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayZone {
    #[default]
    Local,
    Utc,
}

impl DayZone {
    pub fn date_of(&self, ts: DateTime<Utc>) -> NaiveDate {
        match self {
            DayZone::Local => ts.with_timezone(&Local).date_naive(),
            DayZone::Utc => ts.date_naive(),
        }
    }
}

/// A calendar month, e.g. `2024-05`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        // month is validated on construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn days(&self) -> u32 {
        let next = self.next().first_day();
        (next - self.first_day()).num_days() as u32
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got {s:?}"))?;
        let year: i32 = year.parse().map_err(|_| format!("invalid year in {s:?}"))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in {s:?}"))?;
        MonthKey::new(year, month).ok_or_else(|| format!("month out of range in {s:?}"))
    }
}

/// Which on-disk date partitions a scan must visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Day(NaiveDate),
    Month(MonthKey),
    /// Needed when the active dimension ("updated") can fall outside the creation partition.
    All,
}

impl Scope {
    pub fn admits(&self, date: NaiveDate) -> bool {
        match self {
            Scope::Day(day) => *day == date,
            Scope::Month(month) => month.contains(date),
            Scope::All => true,
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    /// `all`, `YYYY-MM` or `YYYY-MM-DD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Scope::All);
        }
        if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(Scope::Day(day));
        }
        s.parse::<MonthKey>()
            .map(Scope::Month)
            .map_err(|_| format!("expected all, YYYY-MM or YYYY-MM-DD, got {s:?}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    UpdatedDesc,
    UpdatedAsc,
    CreatedDesc,
    CreatedAsc,
    SizeDesc,
    EventsDesc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "updated_desc" | "updated" => Ok(SortOrder::UpdatedDesc),
            "updated_asc" => Ok(SortOrder::UpdatedAsc),
            "created_desc" | "created" => Ok(SortOrder::CreatedDesc),
            "created_asc" => Ok(SortOrder::CreatedAsc),
            "size_desc" | "size" => Ok(SortOrder::SizeDesc),
            "events_desc" | "events" => Ok(SortOrder::EventsDesc),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

/// A named group of working directories, optionally nested under a parent project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub directories: Vec<String>,
    /// When set, only sessions whose source tag is listed belong to the project.
    #[serde(default)]
    pub allowed_sources: Option<BTreeSet<String>>,
}

/// User-authored decoration for a session, read from the notes store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNote {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}
