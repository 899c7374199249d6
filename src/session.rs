//! Sessions and their table stores.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::NarratorError;
use crate::store::render::{scenario_text, tables_text};
use crate::store::{Document, TableStore, TableTemplate};

/// Conversation identity; the scheduling and partitioning key.
pub type SessionId = String;

/// The committed scenario of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioState {
    pub summary: Option<String>,
    /// Pipe-delimited rendering of every table.
    pub tables: String,
    /// Summary plus tables; the text that gets injected into the chat.
    pub injection_text: String,
    pub row_count: usize,
}

impl ScenarioState {
    pub fn from_snapshot(doc: &Document) -> Self {
        Self {
            summary: doc.summary.clone(),
            tables: tables_text(doc),
            injection_text: scenario_text(doc),
            row_count: doc.row_count(),
        }
    }

    pub fn of(store: &TableStore) -> Self {
        Self::from_snapshot(&store.snapshot())
    }
}

/// Opens each session's store on first use and hands out shared handles.
#[derive(Debug, Clone)]
pub struct SessionCatalog {
    data_dir: Option<PathBuf>,
    templates: Arc<[TableTemplate]>,
    stores: Arc<Mutex<HashMap<SessionId, TableStore>>>,
}

impl SessionCatalog {
    /// `None` keeps every store in memory for the life of the process.
    pub fn new(data_dir: Option<PathBuf>, templates: Vec<TableTemplate>) -> Self {
        Self {
            data_dir,
            templates: templates.into(),
            stores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.data_dir.clone(), config.templates())
    }

    /// File backing `session`, if the catalog persists.
    pub fn path_for(&self, session: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", file_stem(session))))
    }

    /// The session's store, opening or creating it if needed.
    pub async fn store(&self, session: &str) -> Result<TableStore, NarratorError> {
        if session.trim().is_empty() {
            return Err(NarratorError::validation("session id must not be empty"));
        }
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(session) {
            return Ok(store.clone());
        }
        let store = match self.path_for(session) {
            Some(path) => TableStore::open(path, &self.templates).await?,
            None => TableStore::in_memory(&self.templates)?,
        };
        debug!(session, persistent = store.path().is_some(), "session created");
        stores.insert(session.to_string(), store.clone());
        Ok(store)
    }

    pub async fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.stores.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Session ids become file names. `[A-Za-z0-9-]` is kept and every other
/// byte, `_` included, is written as `_xx` hex, so distinct ids never share
/// a file and no id can leave the data directory.
fn file_stem(session: &str) -> String {
    let mut stem = String::with_capacity(session.len());
    for byte in session.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}
