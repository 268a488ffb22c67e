//! Substring search over transcript contents.
//!
//! Files are read in fixed-size chunks, never whole. Each chunk is searched
//! together with the last `term.len() - 1` bytes of the previous one so a
//! match straddling a boundary is still found. Matching is ASCII
//! case-insensitive.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memchr::memmem;
use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::debug;

use crate::debug_log::PhaseTimer;
use crate::error::Cancelled;
use crate::filter::SearchHits;
use crate::task::{GenerationalTask, Spawned, Ticket};

pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug)]
enum ScanError {
    Io(io::Error),
    Cancelled,
}

impl From<Cancelled> for ScanError {
    fn from(_: Cancelled) -> Self {
        ScanError::Cancelled
    }
}

/// Whether the file at `path` contains `finder`'s needle (already lowercased).
fn file_contains(
    path: &Path,
    finder: &memmem::Finder<'_>,
    chunk_bytes: usize,
    ticket: &Ticket,
) -> Result<bool, ScanError> {
    let needle_len = finder.needle().len();
    let overlap = needle_len.saturating_sub(1);
    let chunk_bytes = chunk_bytes.max(1);

    let mut file = File::open(path).map_err(ScanError::Io)?;
    let mut window: Vec<u8> = Vec::with_capacity(overlap + chunk_bytes);
    let mut chunk = vec![0u8; chunk_bytes];

    loop {
        ticket.checkpoint()?;

        let mut filled = 0;
        while filled < chunk_bytes {
            match file.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ScanError::Io(e)),
            }
        }
        if filled == 0 {
            return Ok(false);
        }

        let carried = window.len();
        window.extend_from_slice(&chunk[..filled]);
        window[carried..].make_ascii_lowercase();

        if finder.find(&window).is_some() {
            return Ok(true);
        }

        let keep_from = window.len().saturating_sub(overlap);
        window.drain(..keep_from);
    }
}

/// Ids of the sessions whose file contains `term`.
///
/// Unreadable files are skipped. Checks `ticket` before each file and each chunk.
pub fn search_files(
    candidates: &[(String, PathBuf)],
    term: &str,
    chunk_bytes: usize,
    ticket: &Ticket,
) -> Result<HashSet<String>, Cancelled> {
    let needle = term.trim().to_ascii_lowercase();
    if needle.is_empty() {
        return Ok(HashSet::new());
    }
    let _timer = PhaseTimer::new("search", format!("{} files", candidates.len()));
    let finder = memmem::Finder::new(needle.as_bytes());

    let matched: Vec<Option<String>> = candidates
        .par_iter()
        .map(|(id, path)| {
            ticket.checkpoint()?;
            match file_contains(path, &finder, chunk_bytes, ticket) {
                Ok(true) => Ok(Some(id.clone())),
                Ok(false) => Ok(None),
                Err(ScanError::Cancelled) => Err(Cancelled),
                Err(ScanError::Io(e)) => {
                    debug!(path = %path.display(), error = %e, "search skipped unreadable file");
                    Ok(None)
                }
            }
        })
        .collect::<Result<_, Cancelled>>()?;

    Ok(matched.into_iter().flatten().collect())
}

/// Background full-text search where each new term replaces the previous one.
pub struct FullTextSearch {
    task: GenerationalTask,
    chunk_bytes: usize,
    latest: Arc<RwLock<Option<Arc<SearchHits>>>>,
}

impl FullTextSearch {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            task: GenerationalTask::new("search"),
            chunk_bytes,
            latest: Arc::new(RwLock::new(None)),
        }
    }

    /// Hits of the newest completed search, if any.
    pub fn latest(&self) -> Option<Arc<SearchHits>> {
        self.latest.read().clone()
    }

    /// Search on the calling thread. Still cancels and is cancelled by other searches.
    pub fn search(&self, term: &str, candidates: &[(String, PathBuf)]) -> Result<Arc<SearchHits>, Cancelled> {
        let ticket = self.task.begin();
        *self.latest.write() = None;
        let ids = search_files(candidates, term, self.chunk_bytes, &ticket)?;
        let hits = Arc::new(SearchHits {
            term: term.to_string(),
            ids,
        });
        let latest = Arc::clone(&self.latest);
        let published = Arc::clone(&hits);
        self.task
            .apply_if_current(&ticket, move || *latest.write() = Some(published))
            .ok_or(Cancelled)?;
        Ok(hits)
    }

    /// Start a search on a worker thread. `on_done` runs with the hits if this term is still current.
    pub fn start(
        &self,
        term: String,
        candidates: Vec<(String, PathBuf)>,
        on_done: impl FnOnce(Arc<SearchHits>) + Send + 'static,
    ) -> Spawned {
        *self.latest.write() = None;
        let chunk_bytes = self.chunk_bytes;
        let latest = Arc::clone(&self.latest);
        self.task.spawn(
            std::time::Duration::ZERO,
            move |ticket| {
                let ids = search_files(&candidates, &term, chunk_bytes, ticket)?;
                Ok(Arc::new(SearchHits { term, ids }))
            },
            move |hits| {
                *latest.write() = Some(Arc::clone(&hits));
                on_done(hits);
            },
        )
    }

    pub fn cancel(&self) {
        self.task.cancel();
        *self.latest.write() = None;
    }
}
