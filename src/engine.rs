//! The caller-facing engine.
//!
//! Owns the record set and every derived view of it. The record set is
//! published as immutable `Arc` snapshots on a watch channel, and every
//! replacement goes through its sender, so writers are serialized. The
//! calendar's copy is swapped while the sender's lock is held. Background work
//! (filtering, enrichment, search, coverage) each has its own generation and
//! only ever touches the record set through the same publish path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::RecordCache;
use crate::calendar::Calendar;
use crate::config::Config;
use crate::enrichment::{EnrichmentBatch, EnrichmentRunner};
use crate::error::{Cancelled, ParseError};
use crate::filter::{FilterInput, FilterOutput, FilterPipeline, FilterState, SearchHits};
use crate::heartbeat::ActivityMonitor;
use crate::indexer::{Indexer, ScanOutput};
use crate::notes::NotesStore;
use crate::parser::ParseOptions;
use crate::path_tree::{self, PathTree, UpdateMode};
use crate::search::FullTextSearch;
use crate::task::{GenerationalTask, Spawned};
use crate::types::{DateDimension, DayZone, MonthKey, Project, Scope, SessionNote, SessionRecord};

/// State shared with background workers.
struct Shared {
    records: watch::Sender<Arc<Vec<SessionRecord>>>,
    calendar: Calendar,
    filter: FilterPipeline,
    /// Last state handed to `set_filter`; re-run whenever its inputs change.
    filter_state: RwLock<Option<FilterState>>,
    notes: RwLock<Arc<HashMap<String, SessionNote>>>,
    projects: Arc<Vec<Project>>,
    search: FullTextSearch,
    zone: DayZone,
}

impl Shared {
    fn snapshot(&self) -> Arc<Vec<SessionRecord>> {
        Arc::clone(&self.records.borrow())
    }

    /// Replace the record set. The calendar is updated inside the same critical section.
    fn publish(&self, records: Vec<SessionRecord>) {
        let records = Arc::new(records);
        self.records.send_modify(|current| {
            *current = Arc::clone(&records);
            self.calendar.set_records(records);
        });
    }

    /// Replace records by path. Records whose file is no longer in the set are not re-added.
    fn merge(&self, updates: Vec<SessionRecord>) -> usize {
        if updates.is_empty() {
            return 0;
        }
        let mut by_path: HashMap<PathBuf, SessionRecord> =
            updates.into_iter().map(|r| (r.path.clone(), r)).collect();
        let mut merged = 0;
        self.records.send_if_modified(|current| {
            let replaced: Vec<SessionRecord> = current
                .iter()
                .map(|record| match by_path.remove(&record.path) {
                    Some(update) => {
                        merged += 1;
                        update
                    }
                    None => record.clone(),
                })
                .collect();
            if merged == 0 {
                return false;
            }
            let replaced = Arc::new(replaced);
            *current = Arc::clone(&replaced);
            self.calendar.set_records(replaced);
            true
        });
        merged
    }

    fn filter_input(&self, state: FilterState) -> FilterInput {
        FilterInput {
            records: self.snapshot(),
            state,
            projects: Arc::clone(&self.projects),
            notes: Arc::clone(&self.notes.read()),
            coverage: self.calendar.coverage(),
            search: self.search.latest(),
            zone: self.zone,
        }
    }

    /// Re-run the current filter over fresh inputs.
    fn refilter(&self) -> Option<Spawned> {
        let state = self.filter_state.read().clone()?;
        Some(self.filter.submit(self.filter_input(state)))
    }
}

pub struct Engine {
    shared: Arc<Shared>,
    indexer: Arc<Indexer>,
    notes: NotesStore,
    enrichment: EnrichmentRunner,
    coverage: GenerationalTask,
    coverage_debounce: std::time::Duration,
    path_tree: RwLock<PathTree>,
    activity: ActivityMonitor,
    scope: RwLock<Option<Scope>>,
}

impl Engine {
    /// Engine over the paths and settings in `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let root = config.sessions_root()?;
        let cache_dir = config.cache_dir()?;
        let cache = Arc::new(RecordCache::open(&cache_dir, config.timing.cache_flush_debounce()));
        Self::with_cache(config, root, cache, config.notes_dir()?)
    }

    pub fn with_cache(
        config: &Config,
        root: PathBuf,
        cache: Arc<RecordCache>,
        notes_dir: PathBuf,
    ) -> Result<Self> {
        let options = ParseOptions {
            head_lines: config.parsing.head_lines,
            tail_bytes: config.parsing.tail_bytes,
        };
        let zone = config.calendar.zone;
        let (records, _) = watch::channel(Arc::new(Vec::new()));
        let notes = NotesStore::new(notes_dir);

        let shared = Arc::new(Shared {
            records,
            calendar: Calendar::new(zone),
            filter: FilterPipeline::new(config.timing.filter_debounce()),
            filter_state: RwLock::new(None),
            notes: RwLock::new(Arc::new(notes.load_all())),
            projects: Arc::new(config.projects.clone()),
            search: FullTextSearch::new(config.parsing.search_chunk_bytes),
            zone,
        });

        let enrichment =
            EnrichmentRunner::new(&config.enrichment).context("Failed to build enrichment pool")?;

        Ok(Self {
            shared,
            indexer: Arc::new(Indexer::new(root, cache, options)),
            notes,
            enrichment,
            coverage: GenerationalTask::new("coverage"),
            coverage_debounce: config.timing.coverage_debounce(),
            path_tree: RwLock::new(PathTree::default()),
            activity: ActivityMonitor::new(
                config.timing.heartbeat_interval(),
                config.timing.heartbeat_window(),
            ),
            scope: RwLock::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        self.indexer.root()
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        self.indexer.cache()
    }

    pub fn zone(&self) -> DayZone {
        self.shared.zone
    }

    /// Current record set.
    pub fn records(&self) -> Arc<Vec<SessionRecord>> {
        self.shared.snapshot()
    }

    pub fn subscribe_records(&self) -> watch::Receiver<Arc<Vec<SessionRecord>>> {
        self.shared.records.subscribe()
    }

    /// Scope of the last refresh.
    pub fn scope(&self) -> Option<Scope> {
        *self.scope.read()
    }

    /// Scan `scope` and make its records the current set.
    ///
    /// Running enrichment belongs to the previous set and is cancelled; a
    /// batch already being applied finishes before the scan starts.
    pub fn refresh(&self, scope: Scope) -> ScanOutput {
        self.enrichment.cancel();
        let output = self.indexer.list_summaries(scope);

        let pruned = self.indexer.cache().prune_missing();
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), "dropped cache entries for vanished files");
        }

        *self.scope.write() = Some(scope);
        self.shared.publish(output.records.clone());
        self.shared.refilter();
        info!(
            records = output.records.len(),
            parsed = output.stats.parsed,
            cache_hits = output.stats.cache_hits,
            "refreshed"
        );
        output
    }

    /// Re-run the last refresh, if any.
    pub fn rescan(&self) -> Option<ScanOutput> {
        let scope = self.scope()?;
        Some(self.refresh(scope))
    }

    /// Fully parse one file and replace its record in the current set.
    pub fn enrich_one(&self, path: &Path) -> Result<SessionRecord, ParseError> {
        let record = self.indexer.enrich(path)?;
        if self.shared.merge(vec![record.clone()]) > 0 {
            self.shared.refilter();
        }
        Ok(record)
    }

    /// Enrich every fast record of the current set in the background.
    ///
    /// Each delivered batch replaces its records and re-runs the filter.
    /// `on_batch` sees every batch after it was applied.
    pub fn start_enrichment(
        &self,
        mut on_batch: impl FnMut(&EnrichmentBatch) + Send + 'static,
    ) -> Spawned {
        let paths: Vec<PathBuf> = self
            .shared
            .snapshot()
            .iter()
            .filter(|r| !r.is_enriched())
            .map(|r| r.path.clone())
            .collect();
        debug!(pending = paths.len(), threads = self.enrichment.threads(), "starting enrichment");

        let shared = Arc::clone(&self.shared);
        self.enrichment
            .start(Arc::clone(&self.indexer), paths, move |batch| {
                shared.merge(batch.records.clone());
                shared.refilter();
                on_batch(&batch);
            })
    }

    fn search_candidates(&self) -> Vec<(String, PathBuf)> {
        self.shared
            .snapshot()
            .iter()
            .map(|r| (r.id.clone(), r.path.clone()))
            .collect()
    }

    /// Full-text search over the current set on the calling thread.
    pub fn search(&self, term: &str) -> Result<Arc<SearchHits>, Cancelled> {
        let hits = self.shared.search.search(term, &self.search_candidates())?;
        self.shared.refilter();
        Ok(hits)
    }

    /// Full-text search in the background. The filter re-runs once hits arrive.
    pub fn start_search(&self, term: &str) -> Spawned {
        let shared = Arc::clone(&self.shared);
        self.shared
            .search
            .start(term.to_string(), self.search_candidates(), move |_| {
                shared.refilter();
            })
    }

    pub fn search_hits(&self) -> Option<Arc<SearchHits>> {
        self.shared.search.latest()
    }

    /// Sessions per working directory over the whole tree, as a tree.
    ///
    /// The tree is patched from the previous counts when possible.
    pub fn directory_counts(&self) -> PathTree {
        let flat = self.indexer.collect_directory_counts();
        let mut tree = self.path_tree.write();
        let deltas = path_tree::diff(tree.flat(), &flat);
        if !deltas.is_empty() {
            let mode = tree.apply_deltas(&deltas);
            debug!(changed = deltas.len(), rebuilt = (mode == UpdateMode::Rebuilt), "path tree updated");
        }
        tree.clone()
    }

    pub fn calendar_counts(&self, month: MonthKey, dimension: DateDimension) -> BTreeMap<u32, u32> {
        self.shared.calendar.counts(month, dimension)
    }

    pub fn coverage_loaded(&self, month: MonthKey) -> bool {
        self.shared.calendar.is_loaded(month)
    }

    /// Load day coverage for `month` in the background, after a short debounce.
    ///
    /// Returns `None` when the month is already loaded or in flight. A newer
    /// request cancels one still pending.
    pub fn request_coverage(&self, month: MonthKey) -> Option<Spawned> {
        let claim = self.shared.calendar.claim(month)?;
        let shared = Arc::clone(&self.shared);
        let worker = Arc::clone(&self.shared);
        Some(self.coverage.spawn(
            self.coverage_debounce,
            move |ticket| worker.calendar.load_coverage(month, ticket),
            move |batch| {
                shared.calendar.install(batch);
                drop(claim);
                shared.refilter();
            },
        ))
    }

    /// Load day coverage for `month` on the calling thread.
    pub fn load_coverage(&self, month: MonthKey) -> Result<(), Cancelled> {
        let Some(claim) = self.shared.calendar.claim(month) else {
            return Ok(());
        };
        let ticket = self.coverage.begin();
        let batch = self.shared.calendar.load_coverage(month, &ticket)?;
        self.coverage
            .apply_if_current(&ticket, || self.shared.calendar.install(batch))
            .ok_or(Cancelled)?;
        drop(claim);
        self.shared.refilter();
        Ok(())
    }

    /// Make `state` the active filter and compute it in the background.
    pub fn set_filter(&self, state: FilterState) -> Spawned {
        *self.shared.filter_state.write() = Some(state.clone());
        self.shared.filter.submit(self.shared.filter_input(state))
    }

    /// Make `state` the active filter and compute it on the calling thread.
    pub fn filter_now(&self, state: FilterState) -> Result<Arc<FilterOutput>, Cancelled> {
        *self.shared.filter_state.write() = Some(state.clone());
        self.shared.filter.run_now(self.shared.filter_input(state))
    }

    /// Receiver of every applied filter result.
    pub fn filtered(&self) -> watch::Receiver<Arc<FilterOutput>> {
        self.shared.filter.subscribe()
    }

    pub fn latest_filtered(&self) -> Arc<FilterOutput> {
        self.shared.filter.latest()
    }

    /// Re-read the notes store and re-run the filter.
    pub fn reload_notes(&self) {
        *self.shared.notes.write() = Arc::new(self.notes.load_all());
        self.shared.refilter();
    }

    pub fn note(&self, id: &str) -> Option<SessionNote> {
        self.shared.notes.read().get(id).cloned()
    }

    /// Ids of the visible sessions still being written to. `None` while rate-limited.
    pub fn poll_activity(&self, visible: &[SessionRecord]) -> Option<HashSet<String>> {
        let visible: Vec<(String, PathBuf)> = visible
            .iter()
            .map(|r| (r.id.clone(), r.path.clone()))
            .collect();
        self.activity.poll(&visible)
    }

    pub fn cancel_filter(&self) {
        self.shared.filter.cancel();
    }

    pub fn cancel_enrichment(&self) {
        self.enrichment.cancel();
    }

    pub fn cancel_search(&self) {
        self.shared.search.cancel();
    }

    pub fn cancel_coverage(&self) {
        self.coverage.cancel();
    }

    /// Stop all background work and write the cache out.
    pub fn shutdown(&self) {
        self.cancel_filter();
        self.cancel_enrichment();
        self.cancel_search();
        self.cancel_coverage();
        if let Err(e) = self.indexer.cache().persist() {
            warn!(error = %e, "failed to persist record cache");
        }
    }
}

#[cfg(test)]
mod tests;
