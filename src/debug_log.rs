//! Diagnostic logging.
//!
//! Enable file logging by setting environment variable: SESSIONDEX_DEBUG_LOG=1
//! Logs are written to /tmp/sessiondex-debug.log, or to the path given as the
//! variable's value. Verbosity follows RUST_LOG when set.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_PATH: &str = "/tmp/sessiondex-debug.log";

/// Install the global subscriber. Call once at startup; later calls are no-ops.
pub fn init() {
    let Ok(target) = std::env::var("SESSIONDEX_DEBUG_LOG") else {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sessiondex=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let path = if target.is_empty() || target == "1" {
        PathBuf::from(DEFAULT_LOG_PATH)
    } else {
        PathBuf::from(target)
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sessiondex=debug"));

    match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
    {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_ids(true)
                .try_init();
            tracing::debug!(path = %path.display(), "debug logging initialized");
        }
        Err(e) => {
            eprintln!(
                "Warning: could not open debug log {}: {e}",
                path.display()
            );
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

/// RAII guard that logs how long a phase took when dropped.
pub struct PhaseTimer {
    phase: &'static str,
    detail: String,
    started: Instant,
}

impl PhaseTimer {
    pub fn new(phase: &'static str, detail: impl Into<String>) -> Self {
        Self {
            phase,
            detail: detail.into(),
            started: Instant::now(),
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        tracing::debug!(
            phase = self.phase,
            detail = %self.detail,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "phase finished"
        );
    }
}
