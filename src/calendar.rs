//! Per-day activity counts for a month, by creation or last-update date.
//!
//! Under the "updated" dimension a session that spans several days should
//! show on each day it touched. Those days come from a deep scan of every
//! event timestamp in the transcript ("coverage"). Coverage is loaded per
//! month on demand; until it arrives a session counts on its last-updated day
//! only, which is the provisional approximation callers see first.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::debug;

use crate::error::Cancelled;
use crate::parser::for_each_event_timestamp;
use crate::task::Ticket;
use crate::types::{DateDimension, DayZone, MonthKey, SessionRecord};

/// Days of each month a session touched, keyed by session id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageMap {
    by_session: HashMap<String, BTreeMap<MonthKey, BTreeSet<u32>>>,
}

impl CoverageMap {
    pub fn days(&self, id: &str, month: MonthKey) -> Option<&BTreeSet<u32>> {
        self.by_session.get(id)?.get(&month)
    }

    /// True if coverage for the date's month is loaded and includes the date.
    pub fn covers(&self, id: &str, date: NaiveDate) -> bool {
        self.days(id, MonthKey::of(date))
            .is_some_and(|days| days.contains(&date.day()))
    }

    pub fn insert(&mut self, id: &str, month: MonthKey, days: BTreeSet<u32>) {
        self.by_session
            .entry(id.to_string())
            .or_default()
            .insert(month, days);
    }

    pub fn forget(&mut self, id: &str) {
        self.by_session.remove(id);
    }

    pub fn len(&self) -> usize {
        self.by_session.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}

/// Coverage computed for one month, ready to install.
#[derive(Debug, Default)]
pub struct CoverageBatch {
    pub month: Option<MonthKey>,
    /// (session id, last-updated at scan time, days)
    entries: Vec<(String, DateTime<Utc>, BTreeSet<u32>)>,
    pub scanned: usize,
}

impl CoverageBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Releases a month's in-flight claim when dropped.
pub struct CoverageClaim {
    month: MonthKey,
    in_flight: Arc<DashMap<MonthKey, ()>>,
}

impl Drop for CoverageClaim {
    fn drop(&mut self) {
        self.in_flight.remove(&self.month);
    }
}

fn month_span(record: &SessionRecord, zone: DayZone) -> (NaiveDate, NaiveDate) {
    let created = record.date_for(DateDimension::Created, zone);
    let updated = record.date_for(DateDimension::Updated, zone);
    (created.min(updated), created.max(updated))
}

/// Days within `month` on which the transcript recorded activity.
///
/// The creation stamp alone does not count as activity; the last-updated day always does.
fn scan_days(record: &SessionRecord, month: MonthKey, zone: DayZone) -> BTreeSet<u32> {
    let mut days = BTreeSet::new();
    let updated = record.date_for(DateDimension::Updated, zone);
    if month.contains(updated) {
        days.insert(updated.day());
    }

    let month_end = month.next().first_day();
    let result = for_each_event_timestamp(&record.path, |ts| {
        let date = zone.date_of(ts);
        if month.contains(date) {
            days.insert(date.day());
        } else if date >= month_end {
            // Append-only: later lines will not return to this month.
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });
    if let Err(e) = result {
        debug!(path = %record.path.display(), error = %e, "coverage scan failed; keeping single-day count");
    }
    days
}

/// Records, coverage and loaded months change together under one lock.
#[derive(Default)]
struct CalendarState {
    records: Arc<Vec<SessionRecord>>,
    coverage: Arc<CoverageMap>,
    loaded_months: HashSet<MonthKey>,
}

pub struct Calendar {
    zone: DayZone,
    state: RwLock<CalendarState>,
    in_flight: Arc<DashMap<MonthKey, ()>>,
    /// Bumped under the state write lock whenever records or coverage change.
    version: AtomicU64,
    counts_cache: Mutex<HashMap<(MonthKey, DateDimension), (u64, BTreeMap<u32, u32>)>>,
}

impl Calendar {
    pub fn new(zone: DayZone) -> Self {
        Self {
            zone,
            state: RwLock::new(CalendarState::default()),
            in_flight: Arc::new(DashMap::new()),
            version: AtomicU64::new(0),
            counts_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn zone(&self) -> DayZone {
        self.zone
    }

    /// Replace the record set. Coverage of sessions that changed or vanished is dropped.
    pub fn set_records(&self, records: Arc<Vec<SessionRecord>>) {
        let zone = self.zone;
        let mut state = self.state.write();

        let next: HashMap<&str, DateTime<Utc>> = records
            .iter()
            .map(|r| (r.id.as_str(), r.last_updated_at))
            .collect();
        let stale: Vec<String> = state
            .records
            .iter()
            .filter(|r| next.get(r.id.as_str()) != Some(&r.last_updated_at))
            .map(|r| r.id.clone())
            .collect();
        let known: HashSet<&str> = state.records.iter().map(|r| r.id.as_str()).collect();
        let added_multi_day = records.iter().any(|r| {
            let (first, last) = month_span(r, zone);
            !known.contains(r.id.as_str()) && first != last
        });

        if !stale.is_empty() {
            let map = Arc::make_mut(&mut state.coverage);
            for id in &stale {
                map.forget(id);
            }
        }
        if !stale.is_empty() || added_multi_day {
            // Loaded months no longer cover every session; the next request fills the gaps.
            state.loaded_months.clear();
        }

        state.records = records;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> Arc<Vec<SessionRecord>> {
        Arc::clone(&self.state.read().records)
    }

    pub fn coverage(&self) -> Arc<CoverageMap> {
        Arc::clone(&self.state.read().coverage)
    }

    pub fn is_loaded(&self, month: MonthKey) -> bool {
        self.state.read().loaded_months.contains(&month)
    }

    /// Claim `month` for loading. `None` if it is already loaded or being loaded.
    pub fn claim(&self, month: MonthKey) -> Option<CoverageClaim> {
        if self.is_loaded(month) {
            return None;
        }
        if self.in_flight.insert(month, ()).is_some() {
            return None;
        }
        Some(CoverageClaim {
            month,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Compute coverage for every session of the current record set that touches `month`.
    ///
    /// Single-day sessions get their one day without reading the file.
    /// Checks `ticket` before each file.
    pub fn load_coverage(&self, month: MonthKey, ticket: &Ticket) -> Result<CoverageBatch, Cancelled> {
        let (records, coverage) = {
            let state = self.state.read();
            (Arc::clone(&state.records), Arc::clone(&state.coverage))
        };
        let zone = self.zone;

        let candidates: Vec<&SessionRecord> = records
            .iter()
            .filter(|r| {
                let (first, last) = month_span(r, zone);
                MonthKey::of(first) <= month
                    && month <= MonthKey::of(last)
                    && coverage.days(&r.id, month).is_none()
            })
            .collect();

        let scanned = candidates
            .iter()
            .filter(|r| {
                let (first, last) = month_span(r, zone);
                first != last
            })
            .count();

        let entries = candidates
            .par_iter()
            .map(|record| {
                ticket.checkpoint()?;
                let (first, last) = month_span(record, zone);
                let days = if first == last {
                    BTreeSet::from([first.day()])
                } else {
                    scan_days(record, month, zone)
                };
                Ok((record.id.clone(), record.last_updated_at, days))
            })
            .collect::<Result<Vec<_>, Cancelled>>()?;

        debug!(month = %month, sessions = entries.len(), scanned, "coverage computed");
        Ok(CoverageBatch {
            month: Some(month),
            entries,
            scanned,
        })
    }

    /// Install a computed batch. Entries for sessions that changed since the scan are dropped.
    ///
    /// The month is marked loaded only if every session touching it is covered
    /// afterwards; otherwise the next request scans the remainder.
    pub fn install(&self, batch: CoverageBatch) {
        let Some(month) = batch.month else {
            return;
        };
        let zone = self.zone;
        let mut state = self.state.write();
        let state = &mut *state;

        let current: HashMap<&str, DateTime<Utc>> = state
            .records
            .iter()
            .map(|r| (r.id.as_str(), r.last_updated_at))
            .collect();
        let map = Arc::make_mut(&mut state.coverage);
        for (id, updated, days) in batch.entries {
            if current.get(id.as_str()) == Some(&updated) {
                map.insert(&id, month, days);
            }
        }

        let complete = state.records.iter().all(|r| {
            let (first, last) = month_span(r, zone);
            MonthKey::of(first) > month
                || MonthKey::of(last) < month
                || map.days(&r.id, month).is_some()
        });
        if complete {
            state.loaded_months.insert(month);
        }
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// `{day of month: sessions}` for `month` under `dimension`.
    pub fn counts(&self, month: MonthKey, dimension: DateDimension) -> BTreeMap<u32, u32> {
        let state = self.state.read();
        // Stable while the read guard is held.
        let version = self.version.load(Ordering::Acquire);
        if let Some((cached_version, counts)) = self.counts_cache.lock().get(&(month, dimension))
            && *cached_version == version
        {
            return counts.clone();
        }

        let records = &state.records;
        let coverage = &state.coverage;
        let mut counts = BTreeMap::new();

        for record in records.iter() {
            match dimension {
                DateDimension::Created => {
                    let date = record.date_for(DateDimension::Created, self.zone);
                    if month.contains(date) {
                        *counts.entry(date.day()).or_insert(0) += 1;
                    }
                }
                DateDimension::Updated => match coverage.days(&record.id, month) {
                    Some(days) => {
                        for day in days {
                            *counts.entry(*day).or_insert(0) += 1;
                        }
                    }
                    None => {
                        let date = record.date_for(DateDimension::Updated, self.zone);
                        if month.contains(date) {
                            *counts.entry(date.day()).or_insert(0) += 1;
                        }
                    }
                },
            }
        }

        self.counts_cache
            .lock()
            .insert((month, dimension), (version, counts.clone()));
        counts
    }
}
