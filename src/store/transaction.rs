//! Buffered, all-or-nothing mutation of a [`TableStore`].

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use super::document::{Document, Fields, Row, TableChange, TableDiff};
use super::schema::TableSchema;
use super::TableStore;
use crate::error::NarratorError;

/// What a successful commit published.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub snapshot: Arc<Document>,
    pub diff: TableDiff,
}

/// Exclusive write access to a store with a private working copy.
///
/// Nothing is visible to readers until [`commit`](Self::commit). Dropping the
/// transaction (or calling [`rollback`](Self::rollback)) discards the working
/// copy and releases the writer lock.
pub struct Transaction {
    store: TableStore,
    _writer: OwnedMutexGuard<()>,
    working: Document,
    diff: TableDiff,
    dirty: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("changes", &self.diff.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Transaction {
    pub(super) fn new(store: TableStore, writer: OwnedMutexGuard<()>, working: Document) -> Self {
        Self {
            store,
            _writer: writer,
            working,
            diff: TableDiff::default(),
            dirty: false,
        }
    }

    /// The working copy, including uncommitted changes.
    pub fn document(&self) -> &Document {
        &self.working
    }

    pub fn diff(&self) -> &TableDiff {
        &self.diff
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn record(&mut self, change: TableChange) {
        self.diff.push(change);
        self.dirty = true;
    }

    pub fn create_table(&mut self, name: &str, schema: TableSchema) -> Result<(), NarratorError> {
        if self.working.create_table(name, schema)? {
            self.record(TableChange::TableCreated {
                table: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn create_row(&mut self, table: &str, fields: Fields) -> Result<String, NarratorError> {
        let id = self.working.create_row(table, fields.clone())?;
        self.record(TableChange::RowCreated {
            table: table.to_string(),
            row_id: id.clone(),
            fields,
        });
        Ok(id)
    }

    pub fn read_table(&self, table: &str) -> Result<Vec<Row>, NarratorError> {
        Ok(self.working.table(table)?.rows.clone())
    }

    pub fn update_cell(
        &mut self,
        table: &str,
        row_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<(), NarratorError> {
        let old = self
            .working
            .update_cell(table, row_id, field, value.clone())?;
        self.record(TableChange::CellUpdated {
            table: table.to_string(),
            row_id: row_id.to_string(),
            field: field.to_string(),
            old,
            new: value,
        });
        Ok(())
    }

    pub fn delete_row(&mut self, table: &str, row_id: &str) -> Result<(), NarratorError> {
        self.working.delete_row(table, row_id)?;
        self.record(TableChange::RowDeleted {
            table: table.to_string(),
            row_id: row_id.to_string(),
        });
        Ok(())
    }

    pub fn reset(&mut self) {
        self.working.reset();
        self.record(TableChange::Reset);
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        let summary = summary.into();
        if self.working.summary.as_deref() != Some(summary.as_str()) {
            self.working.summary = Some(summary);
            self.dirty = true;
        }
    }

    pub fn set_ai_message_offset(&mut self, offset: usize) {
        if self.working.metadata.ai_message_offset != Some(offset) {
            self.working.metadata.ai_message_offset = Some(offset);
            self.dirty = true;
        }
    }

    /// Flush and publish the working copy. A transaction without changes
    /// publishes nothing and writes nothing.
    pub async fn commit(self) -> Result<CommitReceipt, NarratorError> {
        if !self.dirty {
            return Ok(CommitReceipt {
                snapshot: self.store.snapshot(),
                diff: self.diff,
            });
        }
        let snapshot = self.store.publish(self.working).await?;
        Ok(CommitReceipt {
            snapshot,
            diff: self.diff,
        })
    }

    /// Discard all changes.
    pub fn rollback(self) -> TableDiff {
        self.diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::default_templates;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn diff_records_operations_in_order() {
        let store = TableStore::in_memory(&default_templates()).unwrap();
        let mut tx = store.begin().await;
        let id = tx
            .create_row("characters", fields(json!({ "name": "Ember" })))
            .unwrap();
        tx.update_cell("characters", &id, "traits", json!("scaled"))
            .unwrap();
        tx.delete_row("characters", &id).unwrap();

        let receipt = tx.commit().await.unwrap();

        let ops: Vec<_> = receipt
            .diff
            .changes
            .iter()
            .map(|c| serde_json::to_value(c).unwrap()["op"].clone())
            .collect();
        assert_eq!(ops, vec![json!("row_created"), json!("cell_updated"), json!("row_deleted")]);
        assert!(receipt.snapshot.tables["characters"].rows.is_empty());
    }

    #[tokio::test]
    async fn failed_operation_is_not_recorded() {
        let store = TableStore::in_memory(&default_templates()).unwrap();
        let mut tx = store.begin().await;
        assert!(tx.update_cell("characters", "A1", "name", json!("x")).is_err());
        assert!(tx.diff().is_empty());
        assert!(!tx.is_dirty());
    }

    #[tokio::test]
    async fn rollback_discards_changes_and_releases_lock() {
        let store = TableStore::in_memory(&default_templates()).unwrap();
        let mut tx = store.begin().await;
        tx.create_row("characters", fields(json!({ "name": "Ember" })))
            .unwrap();
        let diff = tx.rollback();

        assert_eq!(diff.len(), 1);
        assert!(store.read_table("characters").unwrap().is_empty());
        assert!(store.try_begin().is_some());
    }
}
