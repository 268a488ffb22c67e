use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{DayZone, Project};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub parsing: ParsingConfig,
    pub enrichment: EnrichmentConfig,
    pub timing: TimingConfig,
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub projects: Vec<Project>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the date-partitioned transcript tree. Defaults to ~/.codex/sessions.
    pub sessions_root: Option<PathBuf>,
    /// Where the record cache lives. Defaults to ~/.sessiondex.
    pub cache_dir: Option<PathBuf>,
    /// Notes store. Defaults to a `notes` directory next to the sessions root.
    pub notes_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ParsingConfig {
    pub head_lines: usize,
    pub tail_bytes: u64,
    pub search_chunk_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    /// Worker threads per available core.
    pub parallelism_multiplier: usize,
    pub max_threads: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    pub filter_debounce_ms: u64,
    pub coverage_debounce_ms: u64,
    pub rescan_debounce_ms: u64,
    pub cache_flush_debounce_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_window_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CalendarConfig {
    pub zone: DayZone,
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            head_lines: 64,
            tail_bytes: 64 * 1024,
            search_chunk_bytes: 64 * 1024,
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            batch_interval_ms: 250,
            parallelism_multiplier: 2,
            max_threads: 16,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            filter_debounce_ms: 60,
            coverage_debounce_ms: 150,
            rescan_debounce_ms: 750,
            cache_flush_debounce_ms: 500,
            heartbeat_interval_ms: 5_000,
            heartbeat_window_ms: 30_000,
        }
    }
}

impl EnrichmentConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Thread count for the enrichment pool: a small multiple of the cores, never unbounded.
    pub fn worker_threads(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        (cores * self.parallelism_multiplier.max(1)).clamp(1, self.max_threads.max(1))
    }
}

impl TimingConfig {
    pub fn filter_debounce(&self) -> Duration {
        Duration::from_millis(self.filter_debounce_ms)
    }

    pub fn coverage_debounce(&self) -> Duration {
        Duration::from_millis(self.coverage_debounce_ms)
    }

    pub fn rescan_debounce(&self) -> Duration {
        Duration::from_millis(self.rescan_debounce_ms)
    }

    pub fn cache_flush_debounce(&self) -> Duration {
        Duration::from_millis(self.cache_flush_debounce_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.heartbeat_window_ms)
    }
}

thread_local! {
    static TEST_CONFIG_PATH: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
pub fn set_test_config_path(path: PathBuf) {
    TEST_CONFIG_PATH.with(|p| *p.borrow_mut() = Some(path));
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        #[cfg(test)]
        {
            if let Some(path) = TEST_CONFIG_PATH.with(|p| p.borrow().clone()) {
                return Ok(path);
            }
        }

        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".sessiondex.toml"))
    }

    pub fn load() -> Result<Option<Config>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Some(config))
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn sessions_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.paths.sessions_root {
            return Ok(root.clone());
        }
        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".codex")
            .join("sessions"))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.paths.cache_dir {
            return Ok(dir.clone());
        }
        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".sessiondex"))
    }

    pub fn notes_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.paths.notes_dir {
            return Ok(dir.clone());
        }
        let root = self.sessions_root()?;
        Ok(root
            .parent()
            .map(|parent| parent.join("notes"))
            .unwrap_or_else(|| root.join("notes")))
    }
}

pub fn create_default_config(overwrite: bool) -> Result<()> {
    let config = Config::default();
    let path = Config::config_path()?;
    if !path.exists() || overwrite {
        config.save()?;
        println!("Created default configuration at {}", path.display());
    } else {
        println!("Configuration already exists.  Pass `--overwrite` to overwrite.");
    }
    Ok(())
}

pub fn show_config() -> Result<()> {
    let config = Config::load()?.unwrap_or_default();
    println!("Sessions root:  {}", config.sessions_root()?.display());
    println!("Cache dir:      {}", config.cache_dir()?.display());
    println!("Notes dir:      {}", config.notes_dir()?.display());
    println!("Head lines:     {}", config.parsing.head_lines);
    println!("Tail bytes:     {}", config.parsing.tail_bytes);
    println!("Worker threads: {}", config.enrichment.worker_threads());
    println!("Projects:       {}", config.projects.len());
    Ok(())
}
