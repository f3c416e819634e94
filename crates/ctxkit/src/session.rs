//! Durable session state: one JSON document per session.
//!
//! The document holds the temporal collector's state and the static index
//! (chunks plus per-file content hashes). Each collector rewrites only its
//! own section through [`SessionStore::update`].
//!
//! Writes are atomic: the document is serialized to a sibling temp file and
//! renamed into place. A missing or unparseable file loads as a fresh
//! document; the latter is logged.

use crate::Result;
use crate::collectors::static_index::StaticIndexState;
use crate::collectors::temporal::TemporalState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current document format version.
pub const SESSION_VERSION: u32 = 1;

/// Default session file location, relative to the project root.
pub const DEFAULT_SESSION_PATH: &str = ".ctxkit/session.json";

/// The persisted session document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub temporal: TemporalState,
    #[serde(default)]
    pub static_index: StaticIndexState,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_version() -> u32 {
    SESSION_VERSION
}

impl Default for SessionDocument {
    fn default() -> Self {
        Self {
            version: SESSION_VERSION,
            temporal: TemporalState::default(),
            static_index: StaticIndexState::default(),
            updated_at: None,
        }
    }
}

/// Reads and writes the session document at a fixed path.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session.json".to_string());
        self.path.with_file_name(format!(".{name}.tmp"))
    }

    /// Load the document, or a fresh one if the file is missing or corrupt.
    pub fn load(&self) -> SessionDocument {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No session file at {}, starting fresh", self.path.display());
                return SessionDocument::default();
            }
            Err(e) => {
                warn!("Failed to read session file {}: {e}", self.path.display());
                return SessionDocument::default();
            }
        };
        match serde_json::from_str::<SessionDocument>(&json) {
            Ok(doc) if doc.version <= SESSION_VERSION => doc,
            Ok(doc) => {
                warn!(
                    "Session file {} has unsupported version {}, starting fresh",
                    self.path.display(),
                    doc.version
                );
                SessionDocument::default()
            }
            Err(e) => {
                warn!("Corrupt session file {}, starting fresh: {e}", self.path.display());
                SessionDocument::default()
            }
        }
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, doc: &SessionDocument) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        let tmp_path = self.tmp_path();
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Load, apply `f`, stamp `updated_at`, and save.
    pub fn update(&self, f: impl FnOnce(&mut SessionDocument)) -> Result<()> {
        let mut doc = self.load();
        f(&mut doc);
        doc.version = SESSION_VERSION;
        doc.updated_at = Some(Utc::now());
        self.save(&doc)
    }
}
