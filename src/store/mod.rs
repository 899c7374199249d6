//! Structured table store.
//!
//! A [`TableStore`] owns one scenario [`Document`]. Readers take cheap
//! snapshots (`Arc<Document>`) that never wait on a writer. Writers go through
//! a [`Transaction`], which holds the store's exclusive writer lock, mutates a
//! private working copy, and publishes it with a single atomic file replace
//! on [`Transaction::commit`]. Dropping a transaction discards its changes.
//!
//! ```no_run
//! use narrator::store::{default_templates, TableStore};
//!
//! # async fn example() -> narrator::error::Result<()> {
//! let store = TableStore::open("scenario.json", &default_templates()).await?;
//! let mut tx = store.begin().await;
//! let fields = serde_json::json!({ "name": "Ember" });
//! let id = tx.create_row("characters", fields.as_object().cloned().unwrap_or_default())?;
//! tx.commit().await?;
//! assert_eq!(store.read_table("characters")?[0].id, id);
//! # Ok(())
//! # }
//! ```

pub mod document;
pub mod render;
pub mod schema;
pub mod transaction;

mod persist;

pub use document::{row_id_for, Document, Fields, Metadata, Row, Table, TableChange, TableDiff};
pub use schema::{default_templates, ColumnSpec, TableSchema, TableTemplate};
pub use transaction::{CommitReceipt, Transaction};

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::error::NarratorError;
use crate::util::retry::RetryPolicy;

struct StoreInner {
    path: Option<PathBuf>,
    snapshot: RwLock<Arc<Document>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    retry: RetryPolicy,
}

/// Shared handle to one scenario document. Cloning is cheap.
#[derive(Clone)]
pub struct TableStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableStore")
            .field("path", &self.inner.path)
            .field("rows", &self.snapshot().row_count())
            .finish()
    }
}

impl TableStore {
    fn from_parts(path: Option<PathBuf>, doc: Document) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path,
                snapshot: RwLock::new(Arc::new(doc)),
                writer: Arc::new(tokio::sync::Mutex::new(())),
                retry: RetryPolicy::single_retry(),
            }),
        }
    }

    /// A store that lives only in memory.
    pub fn in_memory(templates: &[TableTemplate]) -> Result<Self, NarratorError> {
        Ok(Self::from_parts(None, Document::from_templates(templates)?))
    }

    /// Open (or create) a file-backed store.
    ///
    /// Tables named in `templates` that the file lacks are added. An existing
    /// table keeps its persisted schema even if the template differs.
    pub async fn open(
        path: impl AsRef<Path>,
        templates: &[TableTemplate],
    ) -> Result<Self, NarratorError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NarratorError::persistence(parent, e.to_string()))?;
        }

        let fresh = Document::from_templates(templates)?;
        let (doc, needs_flush) = match persist::load(&path).await? {
            persist::Loaded::Missing | persist::Loaded::Quarantined(_) => (fresh, true),
            persist::Loaded::Parsed(mut doc) => {
                let mut added = false;
                for template in templates {
                    match doc.tables.get(&template.name) {
                        None => {
                            doc.tables
                                .insert(template.name.clone(), Table::from_template(template));
                            added = true;
                        }
                        Some(existing) if existing.schema != template.schema => {
                            warn!(
                                table = %template.name,
                                "persisted schema differs from configured template; keeping persisted schema"
                            );
                        }
                        Some(_) => {}
                    }
                }
                (doc, added)
            }
        };

        let store = Self::from_parts(Some(path), doc);
        if needs_flush {
            let doc = store.snapshot();
            store.flush(&doc).await?;
        }
        info!(
            path = %store.inner.path.as_deref().unwrap_or(Path::new("")).display(),
            tables = store.snapshot().tables.len(),
            rows = store.snapshot().row_count(),
            "table store opened"
        );
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// The last committed document.
    pub fn snapshot(&self) -> Arc<Document> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Committed rows of one table, in insertion order.
    pub fn read_table(&self, table: &str) -> Result<Vec<Row>, NarratorError> {
        Ok(self.snapshot().table(table)?.rows.clone())
    }

    /// SHA-256 of the persisted bytes (of the encoded snapshot when the
    /// store is in memory).
    pub async fn checksum(&self) -> Result<String, NarratorError> {
        let bytes = match self.path() {
            Some(path) => tokio::fs::read(path)
                .await
                .map_err(|e| NarratorError::persistence(path, e.to_string()))?,
            None => persist::encode(&self.snapshot())?,
        };
        Ok(persist::sha256_hex(&bytes))
    }

    /// Start a transaction; waits for any other writer to finish.
    pub async fn begin(&self) -> Transaction {
        let guard = self.inner.writer.clone().lock_owned().await;
        Transaction::new(self.clone(), guard, (*self.snapshot()).clone())
    }

    /// Start a transaction only if no other writer holds the lock.
    pub fn try_begin(&self) -> Option<Transaction> {
        let guard = self.inner.writer.clone().try_lock_owned().ok()?;
        Some(Transaction::new(self.clone(), guard, (*self.snapshot()).clone()))
    }

    /// Flush then publish. Only called while the writer lock is held.
    pub(crate) async fn publish(&self, doc: Document) -> Result<Arc<Document>, NarratorError> {
        self.flush(&doc).await?;
        let doc = Arc::new(doc);
        *self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = doc.clone();
        Ok(doc)
    }

    async fn flush(&self, doc: &Document) -> Result<(), NarratorError> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        let bytes = persist::encode(doc)?;
        self.inner
            .retry
            .execute(|| persist::write_atomic(path, &bytes))
            .await?;
        debug!(path = %path.display(), bytes = bytes.len(), "scenario flushed");
        Ok(())
    }

    // Single-operation conveniences, each its own committed transaction.

    pub async fn create_table(&self, name: &str, schema: TableSchema) -> Result<(), NarratorError> {
        let mut tx = self.begin().await;
        tx.create_table(name, schema)?;
        tx.commit().await.map(|_| ())
    }

    pub async fn create_row(&self, table: &str, fields: Fields) -> Result<String, NarratorError> {
        let mut tx = self.begin().await;
        let id = tx.create_row(table, fields)?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn update_cell(
        &self,
        table: &str,
        row_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<(), NarratorError> {
        let mut tx = self.begin().await;
        tx.update_cell(table, row_id, field, value)?;
        tx.commit().await.map(|_| ())
    }

    pub async fn delete_row(&self, table: &str, row_id: &str) -> Result<(), NarratorError> {
        let mut tx = self.begin().await;
        tx.delete_row(table, row_id)?;
        tx.commit().await.map(|_| ())
    }

    /// Clear every row, the summary and the id counter; schemas stay.
    pub async fn reset(&self) -> Result<(), NarratorError> {
        let mut tx = self.begin().await;
        tx.reset();
        tx.commit().await.map(|_| ())
    }

    pub async fn set_ai_message_offset(&self, offset: usize) -> Result<(), NarratorError> {
        let mut tx = self.begin().await;
        tx.set_ai_message_offset(offset);
        tx.commit().await.map(|_| ())
    }
}
