//! Walks the date-partitioned session tree and produces records, consulting
//! the cache before touching any file's contents.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use rayon::prelude::*;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cache::RecordCache;
use crate::debug_log::PhaseTimer;
use crate::error::{FileSystemError, ParseError};
use crate::parser::{ParseMode, ParseOptions, parse};
use crate::types::{Scope, SessionRecord};
use crate::utils::file_stamp;

/// Which slice of the calendar an on-disk directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    Year(i32),
    Month(i32, u32),
    Day(NaiveDate),
}

impl Partition {
    fn could_contain(&self, scope: &Scope) -> bool {
        match (scope, self) {
            (Scope::All, _) => true,
            (_, Partition::Day(d)) => scope.admits(*d),
            (Scope::Day(day), Partition::Year(y)) => day.year() == *y,
            (Scope::Day(day), Partition::Month(y, m)) => day.year() == *y && day.month() == *m,
            (Scope::Month(month), Partition::Year(y)) => month.year == *y,
            (Scope::Month(month), Partition::Month(y, m)) => month.year == *y && month.month == *m,
        }
    }
}

fn fixed_digits<T: std::str::FromStr>(segment: &str, width: usize) -> Option<T> {
    if segment.len() == width && segment.bytes().all(|b| b.is_ascii_digit()) {
        segment.parse().ok()
    } else {
        None
    }
}

/// Partition named by a path relative to the sessions root.
///
/// Recognizes `YYYY-MM-DD/...` and `YYYY/MM/DD/...`; anything else is `None`.
fn partition_of(relative: &Path) -> Option<Partition> {
    let segments: Vec<&str> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .take(3)
        .collect();
    let first = *segments.first()?;

    if let Ok(day) = NaiveDate::parse_from_str(first, "%Y-%m-%d") {
        return Some(Partition::Day(day));
    }

    let year: i32 = fixed_digits(first, 4)?;
    let Some(month) = segments.get(1).and_then(|s| fixed_digits::<u32>(s, 2)) else {
        return Some(Partition::Year(year));
    };
    if !(1..=12).contains(&month) {
        return Some(Partition::Year(year));
    }
    match segments
        .get(2)
        .and_then(|s| fixed_digits::<u32>(s, 2))
        .and_then(|d| NaiveDate::from_ymd_opt(year, month, d))
    {
        Some(day) => Some(Partition::Day(day)),
        None => Some(Partition::Month(year, month)),
    }
}

fn is_transcript(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "jsonl")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub candidates: usize,
    pub cache_hits: usize,
    pub parsed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct ScanOutput {
    pub records: Vec<SessionRecord>,
    /// One line per skipped file.
    pub warnings: Vec<String>,
    /// Set when the root or a directory below it could not be read.
    pub condition: Option<FileSystemError>,
    pub stats: ScanStats,
}

enum Lookup {
    Hit(SessionRecord),
    Parsed(SessionRecord),
    Failed(ParseError),
    /// Deleted between the walk and the stat.
    Vanished,
}

pub struct Indexer {
    root: PathBuf,
    cache: Arc<RecordCache>,
    options: ParseOptions,
}

impl Indexer {
    pub fn new(root: PathBuf, cache: Arc<RecordCache>, options: ParseOptions) -> Self {
        Self {
            root,
            cache,
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    /// Candidate transcript paths for `scope`, sorted. Directories that cannot hold the scope are never entered.
    fn discover(&self, scope: &Scope) -> (Vec<PathBuf>, Vec<String>, Option<FileSystemError>) {
        let mut paths = Vec::new();
        let mut warnings = Vec::new();
        let mut condition = None;

        let root = self.root.as_path();
        let walker = WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                match entry.path().strip_prefix(root).ok().and_then(partition_of) {
                    Some(partition) => partition.could_contain(scope),
                    // Unpartitioned directories are only visited for whole-tree scans.
                    None => matches!(scope, Scope::All),
                }
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    warn!(path = %path.display(), error = %e, "skipping unreadable directory entry");
                    warnings.push(format!("{}: {e}", path.display()));
                    condition.get_or_insert(FileSystemError::Unreadable {
                        path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_transcript(entry.path()) {
                continue;
            }
            // Loose files at the root belong to no partition.
            if entry.depth() == 1 && !matches!(scope, Scope::All) {
                continue;
            }
            paths.push(entry.into_path());
        }

        paths.sort();
        (paths, warnings, condition)
    }

    fn lookup(&self, path: &Path) -> Lookup {
        let Some((_, mtime_ms)) = file_stamp(path) else {
            return Lookup::Vanished;
        };
        if let Some(record) = self.cache.get_with_mtime(path, mtime_ms) {
            return Lookup::Hit(record);
        }
        match parse(path, ParseMode::Fast, &self.options) {
            Ok(record) => {
                self.cache.put(path, mtime_ms, record.clone());
                Lookup::Parsed(record)
            }
            Err(e) => Lookup::Failed(e),
        }
    }

    /// Records for every transcript in `scope`. Unreadable files are skipped with a warning.
    pub fn list_summaries(&self, scope: Scope) -> ScanOutput {
        let _timer = PhaseTimer::new("list_summaries", format!("{scope:?}"));

        if !self.root.is_dir() {
            warn!(root = %self.root.display(), "sessions root is missing");
            return ScanOutput {
                condition: Some(FileSystemError::RootMissing(self.root.clone())),
                ..Default::default()
            };
        }

        let (paths, mut warnings, condition) = self.discover(&scope);
        let mut stats = ScanStats {
            candidates: paths.len(),
            ..Default::default()
        };

        let lookups: Vec<Lookup> = paths.par_iter().map(|path| self.lookup(path)).collect();

        let mut records = Vec::with_capacity(lookups.len());
        for lookup in lookups {
            match lookup {
                Lookup::Hit(record) => {
                    stats.cache_hits += 1;
                    records.push(record);
                }
                Lookup::Parsed(record) => {
                    stats.parsed += 1;
                    records.push(record);
                }
                Lookup::Failed(e) => {
                    stats.failed += 1;
                    warn!(path = %e.path().display(), error = %e, "skipping transcript");
                    warnings.push(e.to_string());
                }
                Lookup::Vanished => {}
            }
        }

        debug!(
            candidates = stats.candidates,
            cache_hits = stats.cache_hits,
            parsed = stats.parsed,
            failed = stats.failed,
            "scan finished"
        );

        ScanOutput {
            records,
            warnings,
            condition,
            stats,
        }
    }

    /// Full parse of one file, cached under the modification time seen before reading.
    pub fn enrich(&self, path: &Path) -> Result<SessionRecord, ParseError> {
        let mtime_ms = file_stamp(path).map(|(_, mtime)| mtime);
        let record = parse(path, ParseMode::Full, &self.options)?;
        if let Some(mtime_ms) = mtime_ms {
            self.cache.put(path, mtime_ms, record.clone());
        }
        Ok(record)
    }

    /// Sessions per working directory across the whole tree, from fast records only.
    pub fn collect_directory_counts(&self) -> BTreeMap<String, u64> {
        directory_counts(&self.list_summaries(Scope::All).records)
    }
}

/// Flat `{cwd: sessions}` map. Records without a working directory are not counted.
pub fn directory_counts(records: &[SessionRecord]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for record in records {
        if let Some(cwd) = &record.cwd {
            *counts.entry(cwd.clone()).or_insert(0) += 1;
        }
    }
    counts
}
