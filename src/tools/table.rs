//! Table tools: the only way a model touches scenario tables.
//!
//! Mutating tools act on a [`TransactionHandle`] owned by the running stage,
//! so their effects stay private until the engine commits. Once the engine
//! closes the handle (commit, timeout, cancellation) further calls fail
//! fatally and the loop stops.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use crate::error::NarratorError;
use crate::store::render::tables_text;
use crate::store::{Document, TableStore, Transaction};
use crate::tools::arguments::ToolArguments;
use crate::tools::tool::{AgentTool, Tool, ToolExecutionContext};
use crate::tools::types::AgentToolParameters;

/// Shared slot holding a stage's open transaction.
#[derive(Clone, Default)]
pub struct TransactionHandle {
    slot: Arc<Mutex<Option<Transaction>>>,
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle").finish_non_exhaustive()
    }
}

impl TransactionHandle {
    pub fn new(tx: Transaction) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Take the transaction out, closing the handle. Waits for a tool that
    /// is mid-operation.
    pub async fn take(&self) -> Option<Transaction> {
        self.slot.lock().await.take()
    }

    async fn with<T>(
        &self,
        f: impl FnOnce(&mut Transaction) -> Result<T, NarratorError>,
    ) -> Result<T, NarratorError> {
        let mut slot = self.slot.lock().await;
        let tx = slot
            .as_mut()
            .ok_or_else(|| NarratorError::InvalidState("scenario transaction is closed".into()))?;
        f(tx)
    }
}

/// Where `read_table` reads from.
#[derive(Debug, Clone)]
pub enum TableSource {
    /// Last committed snapshot; used by read-only stages.
    Committed(TableStore),
    /// The stage's working copy, including its own uncommitted edits.
    Working(TransactionHandle),
}

impl TableSource {
    async fn read(&self, args: &ToolArguments) -> Result<serde_json::Value, NarratorError> {
        match self {
            TableSource::Committed(store) => read_document(&store.snapshot(), args),
            TableSource::Working(handle) => {
                handle.with(|tx| read_document(tx.document(), args)).await
            }
        }
    }
}

fn read_document(doc: &Document, args: &ToolArguments) -> Result<serde_json::Value, NarratorError> {
    match args.get_str_opt("table") {
        Some(table) => Ok(json!({
            "table": table,
            "rows": doc.table(table)?.rows,
        })),
        None => Ok(json!({ "tables": tables_text(doc) })),
    }
}

pub fn read_table_tool(source: TableSource) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "read_table",
        "Read the rows of one scenario table, or every table as text when no table is given",
        AgentToolParameters::object()
            .string("table", "Table name; omit to read all tables", false)
            .build(),
        move |args, _ctx: ToolExecutionContext| {
            let source = source.clone();
            async move { source.read(&args).await }
        },
    ))
}

pub fn create_row_tool(handle: TransactionHandle) -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "create_row",
            "Add a row to a scenario table. Fields must be columns of that table; required columns must be set",
            AgentToolParameters::object()
                .string("table", "Table name", true)
                .object("fields", "Column values for the new row", true)
                .build(),
            move |args, _ctx: ToolExecutionContext| {
                let handle = handle.clone();
                async move {
                    let table = args.get_str("table")?;
                    let fields = args.get_object("fields")?.clone();
                    let id = handle.with(|tx| tx.create_row(table, fields)).await?;
                    Ok(json!({ "row_id": id }))
                }
            },
        )
        .mutating(),
    )
}

pub fn update_cell_tool(handle: TransactionHandle) -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "update_cell",
            "Set one cell of an existing row; null clears an optional cell",
            AgentToolParameters::object()
                .string("table", "Table name", true)
                .string("row_id", "Row id such as A3", true)
                .string("field", "Column name", true)
                .any("value", "New cell value", true)
                .build(),
            move |args, _ctx: ToolExecutionContext| {
                let handle = handle.clone();
                async move {
                    let table = args.get_str("table")?;
                    let row_id = args.get_str("row_id")?;
                    let field = args.get_str("field")?;
                    let value = args.get_value("value")?.clone();
                    handle
                        .with(|tx| tx.update_cell(table, row_id, field, value))
                        .await?;
                    Ok(json!({ "updated": row_id }))
                }
            },
        )
        .mutating(),
    )
}

pub fn delete_row_tool(handle: TransactionHandle) -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "delete_row",
            "Delete a row by id",
            AgentToolParameters::object()
                .string("table", "Table name", true)
                .string("row_id", "Row id such as A3", true)
                .build(),
            move |args, _ctx: ToolExecutionContext| {
                let handle = handle.clone();
                async move {
                    let table = args.get_str("table")?;
                    let row_id = args.get_str("row_id")?;
                    handle.with(|tx| tx.delete_row(table, row_id)).await?;
                    Ok(json!({ "deleted": row_id }))
                }
            },
        )
        .mutating(),
    )
}

pub fn reset_tables_tool(handle: TransactionHandle) -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "reset_tables",
            "Remove every row from every table and clear the summary",
            AgentToolParameters::empty(),
            move |_args, _ctx: ToolExecutionContext| {
                let handle = handle.clone();
                async move {
                    handle
                        .with(|tx| {
                            tx.reset();
                            Ok(())
                        })
                        .await?;
                    Ok(json!({ "reset": true }))
                }
            },
        )
        .mutating(),
    )
}

/// Every table tool bound to one transaction.
pub fn table_tools(handle: &TransactionHandle) -> Vec<Arc<dyn Tool>> {
    vec![
        read_table_tool(TableSource::Working(handle.clone())),
        create_row_tool(handle.clone()),
        update_cell_tool(handle.clone()),
        delete_row_tool(handle.clone()),
        reset_tables_tool(handle.clone()),
    ]
}
