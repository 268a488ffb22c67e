//! Read-only access to user notes, one `<session id>.json` per session.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::types::SessionNote;
use crate::utils::warn_once;

#[derive(Debug, Clone)]
pub struct NotesStore {
    dir: PathBuf,
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && id != "." && id != ".."
}

fn read_note(path: &Path) -> Option<SessionNote> {
    let mut bytes = fs::read(path).ok()?;
    match simd_json::from_slice::<SessionNote>(&mut bytes) {
        Ok(note) => Some(note),
        Err(e) => {
            warn_once(format!("Ignoring unreadable note {}: {e}", path.display()));
            None
        }
    }
}

impl NotesStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn read(&self, id: &str) -> Option<SessionNote> {
        if !is_safe_id(id) {
            return None;
        }
        read_note(&self.dir.join(format!("{id}.json")))
    }

    /// Every readable note in the store, keyed by session id.
    pub fn load_all(&self) -> HashMap<String, SessionNote> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            debug!(dir = %self.dir.display(), "notes directory not readable");
            return HashMap::new();
        };

        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let id = path.file_stem()?.to_str()?.to_string();
                Some((id, read_note(&path)?))
            })
            .collect()
    }
}
