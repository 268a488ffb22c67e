//! Background full parsing of fast records.
//!
//! Files are enriched on a dedicated, bounded rayon pool. Results flow to a
//! batcher thread that hands them to the caller every `batch_size` records or
//! every `batch_interval`, whichever comes first. A new run cancels the
//! previous one; batches from a superseded run are never delivered.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::EnrichmentConfig;
use crate::error::ParseError;
use crate::indexer::Indexer;
use crate::task::{GenerationalTask, Spawned};
use crate::types::SessionRecord;

#[derive(Debug, Clone, Default)]
pub struct EnrichmentBatch {
    pub generation: u64,
    pub records: Vec<SessionRecord>,
    /// Files that failed to enrich in this batch; their fast records stand.
    pub failed: Vec<PathBuf>,
    /// Set on the final batch of a run that was not cancelled.
    pub done: bool,
}

/// How often an idle batcher wakes to notice cancellation.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Tracks the age of the pending batch.
#[derive(Debug)]
struct FlushClock {
    interval: Duration,
    started: Instant,
}

impl FlushClock {
    fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            started: now,
        }
    }

    /// How long to block for the next result. Nothing pending means nothing
    /// is due, so the wait does not shrink with the time spent idle.
    fn wait(&self, has_pending: bool, now: Instant) -> Duration {
        if has_pending {
            self.interval.saturating_sub(now.saturating_duration_since(self.started))
        } else {
            IDLE_POLL
        }
    }

    fn due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.interval
    }

    /// A batch starts aging when its first result arrives.
    fn restart(&mut self, now: Instant) {
        self.started = now;
    }
}

pub struct EnrichmentRunner {
    pool: Arc<rayon::ThreadPool>,
    task: GenerationalTask,
    batch_size: usize,
    batch_interval: Duration,
}

impl EnrichmentRunner {
    pub fn new(config: &EnrichmentConfig) -> Result<Self, rayon::ThreadPoolBuildError> {
        let threads = config.worker_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sessiondex-enrich-{i}"))
            .build()?;
        debug!(threads, "enrichment pool ready");
        Ok(Self {
            pool: Arc::new(pool),
            task: GenerationalTask::new("enrichment"),
            batch_size: config.batch_size.max(1),
            batch_interval: config.batch_interval(),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Enrich `paths`, delivering batches to `deliver` while this run is current.
    pub fn start<F>(&self, indexer: Arc<Indexer>, paths: Vec<PathBuf>, mut deliver: F) -> Spawned
    where
        F: FnMut(EnrichmentBatch) + Send + 'static,
    {
        let batch_size = self.batch_size;
        let batch_interval = self.batch_interval;
        let pool = Arc::clone(&self.pool);
        let task = self.task.clone();

        self.task.spawn(
            Duration::ZERO,
            move |ticket| {
                let generation = ticket.generation();
                let (tx, rx) = mpsc::channel::<Result<SessionRecord, ParseError>>();
                let worker_ticket = ticket.clone();

                pool.spawn(move || {
                    paths.par_iter().for_each_with(tx, |tx, path| {
                        if !worker_ticket.is_current() {
                            return;
                        }
                        let _ = tx.send(indexer.enrich(path));
                    });
                });

                let mut pending = EnrichmentBatch {
                    generation,
                    ..Default::default()
                };
                let mut clock = FlushClock::new(batch_interval, Instant::now());
                let mut flush = |pending: &mut EnrichmentBatch, done: bool| {
                    let batch = EnrichmentBatch {
                        generation,
                        records: std::mem::take(&mut pending.records),
                        failed: std::mem::take(&mut pending.failed),
                        done,
                    };
                    task.apply_if_current(ticket, || deliver(batch)).is_some()
                };

                loop {
                    ticket.checkpoint()?;
                    let has_pending = !(pending.records.is_empty() && pending.failed.is_empty());
                    let received = rx.recv_timeout(clock.wait(has_pending, Instant::now()));
                    if received.is_ok() && !has_pending {
                        clock.restart(Instant::now());
                    }
                    match received {
                        Ok(Ok(record)) => pending.records.push(record),
                        Ok(Err(e)) => {
                            warn!(path = %e.path().display(), error = %e, "enrichment failed; keeping fast record");
                            pending.failed.push(e.path().clone());
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let queued = pending.records.len() + pending.failed.len();
                    let size_due = queued >= batch_size;
                    let time_due = queued > 0 && clock.due(Instant::now());
                    if (size_due || time_due) && !flush(&mut pending, false) {
                        return Err(crate::error::Cancelled);
                    }
                }

                if !flush(&mut pending, true) {
                    return Err(crate::error::Cancelled);
                }
                Ok(())
            },
            |()| {},
        )
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RecordCache;
    use crate::parser::ParseOptions;
    use crate::testing::TranscriptBuilder;
    use crate::types::Scope;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn setup(count: usize) -> (TempDir, Arc<Indexer>, Vec<PathBuf>) {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for i in 0..count {
            let path = TranscriptBuilder::new(&format!("s{i}"), "2024-05-01T09:00:00Z")
                .user("2024-05-01T09:00:01Z", "hi")
                .tool_call("2024-05-01T09:00:02Z", "shell")
                .write_to(&dir.path().join(format!("2024-05-01/s{i}.jsonl")));
            paths.push(path);
        }
        let indexer = Arc::new(Indexer::new(
            dir.path().to_path_buf(),
            Arc::new(RecordCache::in_memory()),
            ParseOptions::default(),
        ));
        (dir, indexer, paths)
    }

    fn config(batch_size: usize) -> EnrichmentConfig {
        EnrichmentConfig {
            batch_size,
            batch_interval_ms: 10_000,
            parallelism_multiplier: 1,
            max_threads: 2,
        }
    }

    #[test]
    fn delivers_every_record_in_bounded_batches() {
        let (_dir, indexer, paths) = setup(7);
        let runner = EnrichmentRunner::new(&config(3)).unwrap();
        assert!(runner.threads() <= 2);
        let batches = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&batches);
        runner
            .start(Arc::clone(&indexer), paths, move |batch| sink.lock().push(batch))
            .join();

        let batches = batches.lock();
        let total: usize = batches.iter().map(|b| b.records.len()).sum();
        assert_eq!(total, 7);
        assert!(batches.iter().all(|b| b.records.len() <= 3));
        assert!(batches.last().unwrap().done);
        assert!(batches.iter().flat_map(|b| &b.records).all(|r| r.is_enriched()));

        // Enriched records landed in the cache.
        let rescan = indexer.list_summaries(Scope::All);
        assert_eq!(rescan.stats.parsed, 0);
        assert!(rescan.records.iter().all(|r| r.is_enriched()));
    }

    #[test]
    fn interval_flushes_partial_batches() {
        let (_dir, indexer, paths) = setup(2);
        let runner = EnrichmentRunner::new(&EnrichmentConfig {
            batch_interval_ms: 1,
            ..config(100)
        })
        .unwrap();
        let batches = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&batches);
        runner
            .start(indexer, paths, move |batch| sink.lock().push(batch))
            .join();

        let total: usize = batches.lock().iter().map(|b| b.records.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn failures_are_reported_not_dropped_silently() {
        let (dir, indexer, mut paths) = setup(2);
        let broken = dir.path().join("2024-05-01/broken.jsonl");
        std::fs::write(&broken, "garbage\n").unwrap();
        paths.push(broken.clone());

        let runner = EnrichmentRunner::new(&config(10)).unwrap();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        runner
            .start(indexer, paths, move |batch| sink.lock().push(batch))
            .join();

        let batches = batches.lock();
        let failed: Vec<&PathBuf> = batches.iter().flat_map(|b| &b.failed).collect();
        assert_eq!(failed, vec![&broken]);
        assert_eq!(batches.iter().map(|b| b.records.len()).sum::<usize>(), 2);
    }

    #[test]
    fn idle_batcher_blocks_instead_of_polling() {
        let start = Instant::now();
        let clock = FlushClock::new(Duration::from_millis(1), start);
        let later = start + Duration::from_secs(5);

        // Long past the interval with nothing queued: still a full idle wait.
        assert_eq!(clock.wait(false, later), IDLE_POLL);
        assert!(!clock.wait(false, start).is_zero());

        let mut clock = FlushClock::new(Duration::from_millis(200), start);
        clock.restart(later);
        assert!(!clock.due(later + Duration::from_millis(100)));
        assert_eq!(clock.wait(true, later + Duration::from_millis(150)), Duration::from_millis(50));
        assert!(clock.due(later + Duration::from_millis(200)));
    }

    #[test]
    fn batcher_waits_quietly_while_workers_are_busy() {
        let (_dir, indexer, paths) = setup(2);
        let runner = EnrichmentRunner::new(&EnrichmentConfig {
            batch_interval_ms: 1,
            max_threads: 1,
            ..config(100)
        })
        .unwrap();

        // Occupy the only worker so no result can arrive.
        let (release, gate) = mpsc::channel::<()>();
        runner.pool.spawn(move || {
            let _ = gate.recv();
        });

        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let spawned = runner.start(indexer, paths, move |batch| sink.lock().push(batch));

        std::thread::sleep(Duration::from_millis(50));
        assert!(batches.lock().is_empty());

        release.send(()).unwrap();
        spawned.join();

        let batches = batches.lock();
        assert_eq!(batches.iter().map(|b| b.records.len()).sum::<usize>(), 2);
        assert!(batches.last().unwrap().done);
    }

    #[test]
    fn cancelled_run_stops_delivering() {
        let (_dir, indexer, paths) = setup(5);
        let runner = EnrichmentRunner::new(&config(1)).unwrap();
        let delivered = Arc::new(Mutex::new(0usize));

        let counter = Arc::clone(&delivered);
        let task = runner.task.clone();
        runner
            .start(indexer, paths, move |_| {
                *counter.lock() += 1;
                // Superseded right after the first batch lands.
                task.cancel();
            })
            .join();

        assert_eq!(*delivered.lock(), 1);
    }
}
