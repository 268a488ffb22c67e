use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_types::event::{Event, EventKind};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// A transcript was created or appended to
    FileChanged(PathBuf),
    /// A transcript was deleted
    FileDeleted(PathBuf),
    /// An error occurred
    Error(String),
}

pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    event_rx: Receiver<WatcherEvent>,
}

impl FileWatcher {
    /// Watch `root` recursively for transcript changes.
    pub fn new(root: &Path) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => handle_fs_event(event, &event_tx),
                Err(e) => {
                    let _ = event_tx.send(WatcherEvent::Error(format!("Watch error: {e}")));
                }
            })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Could not watch {}", root.display()))?;
        debug!(root = %root.display(), "watching sessions root");

        Ok(Self {
            _watcher: watcher,
            event_rx,
        })
    }

    pub fn try_recv(&self) -> Option<WatcherEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Feed events into `debouncer` until it has a rescan ready or `timeout` passes.
    pub fn pump(&self, debouncer: &mut RescanDebouncer, timeout: Duration) -> Option<RescanRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if let Some(request) = debouncer.ready(now) {
                return Some(request);
            }
            if now >= deadline {
                return None;
            }
            let wait = debouncer
                .next_deadline()
                .map_or(deadline, |due| due.min(deadline))
                .saturating_duration_since(now);

            match self.event_rx.recv_timeout(wait) {
                Ok(event) => debouncer.note(&event, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return debouncer.flush(),
            }
        }
    }
}

fn is_transcript(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "jsonl")
}

fn handle_fs_event(event: Event, tx: &Sender<WatcherEvent>) {
    let wrap: fn(PathBuf) -> WatcherEvent = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => WatcherEvent::FileChanged,
        EventKind::Remove(_) => WatcherEvent::FileDeleted,
        _ => return,
    };
    for path in event.paths {
        if is_transcript(&path) {
            let _ = tx.send(wrap(path));
        }
    }
}

/// Paths touched during one burst of file-system activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanRequest {
    pub changed: BTreeSet<PathBuf>,
    pub removed: BTreeSet<PathBuf>,
}

impl RescanRequest {
    pub fn len(&self) -> usize {
        self.changed.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Coalesces a burst of notifications into one rescan.
///
/// A rescan is due once no event arrived for `quiet`, or `max_wait` after
/// the first event of the burst, so a writer that never pauses still gets
/// picked up.
#[derive(Debug)]
pub struct RescanDebouncer {
    quiet: Duration,
    max_wait: Duration,
    first_event: Option<Instant>,
    last_event: Option<Instant>,
    pending: RescanRequest,
}

impl RescanDebouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            max_wait: quiet * 8,
            first_event: None,
            last_event: None,
            pending: RescanRequest::default(),
        }
    }

    pub fn note(&mut self, event: &WatcherEvent, now: Instant) {
        match event {
            WatcherEvent::FileChanged(path) => {
                self.pending.removed.remove(path);
                self.pending.changed.insert(path.clone());
            }
            WatcherEvent::FileDeleted(path) => {
                self.pending.changed.remove(path);
                self.pending.removed.insert(path.clone());
            }
            WatcherEvent::Error(message) => {
                warn!(error = %message, "file watcher error");
                return;
            }
        }
        self.first_event.get_or_insert(now);
        self.last_event = Some(now);
    }

    /// When the pending burst becomes due, if anything is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        let first = self.first_event?;
        let last = self.last_event?;
        Some((last + self.quiet).min(first + self.max_wait))
    }

    pub fn ready(&mut self, now: Instant) -> Option<RescanRequest> {
        match self.next_deadline() {
            Some(due) if now >= due => self.flush(),
            _ => None,
        }
    }

    /// Take whatever is pending regardless of timing.
    pub fn flush(&mut self) -> Option<RescanRequest> {
        self.first_event = None;
        self.last_event = None;
        let request = std::mem::take(&mut self.pending);
        if request.is_empty() {
            None
        } else {
            debug!(changed = request.changed.len(), removed = request.removed.len(), "rescan due");
            Some(request)
        }
    }
}
