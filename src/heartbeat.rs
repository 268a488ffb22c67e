//! Cheap liveness signal for the sessions currently on screen.
//!
//! At most once per poll interval, stat the visible transcripts and note
//! which ones grew since the previous look. A session counts as active while
//! its last observed growth is within the trailing window.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::utils::file_stamp;

#[derive(Debug, Clone, Copy)]
struct Observation {
    size: u64,
    mtime_ms: i64,
    last_growing: Option<Instant>,
}

#[derive(Debug, Default)]
struct MonitorState {
    last_poll: Option<Instant>,
    observed: HashMap<String, Observation>,
}

#[derive(Debug)]
pub struct ActivityMonitor {
    interval: Duration,
    window: Duration,
    state: Mutex<MonitorState>,
}

impl ActivityMonitor {
    pub fn new(interval: Duration, window: Duration) -> Self {
        Self {
            interval,
            window,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Poll now. Returns `None` when called again before the interval elapsed.
    pub fn poll(&self, visible: &[(String, PathBuf)]) -> Option<HashSet<String>> {
        self.poll_at(visible, Instant::now())
    }

    pub fn poll_at(&self, visible: &[(String, PathBuf)], now: Instant) -> Option<HashSet<String>> {
        let mut state = self.state.lock();
        if let Some(last) = state.last_poll
            && now.saturating_duration_since(last) < self.interval
        {
            return None;
        }
        state.last_poll = Some(now);

        let mut next = HashMap::with_capacity(visible.len());
        for (id, path) in visible {
            let Some((size, mtime_ms)) = file_stamp(path) else {
                continue;
            };
            let observation = match state.observed.get(id) {
                Some(prev) => {
                    let grew = size > prev.size || mtime_ms > prev.mtime_ms;
                    Observation {
                        size,
                        mtime_ms,
                        last_growing: if grew { Some(now) } else { prev.last_growing },
                    }
                }
                // First sighting is a baseline, not growth.
                None => Observation {
                    size,
                    mtime_ms,
                    last_growing: None,
                },
            };
            next.insert(id.clone(), observation);
        }
        state.observed = next;

        Some(self.active_in(&state, now))
    }

    fn active_in(&self, state: &MonitorState, now: Instant) -> HashSet<String> {
        state
            .observed
            .iter()
            .filter(|(_, obs)| {
                obs.last_growing
                    .is_some_and(|at| now.saturating_duration_since(at) <= self.window)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Sessions active as of `now`, from the last poll's observations.
    pub fn active(&self) -> HashSet<String> {
        let state = self.state.lock();
        self.active_in(&state, Instant::now())
    }
}
