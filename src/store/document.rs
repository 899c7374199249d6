//! The persisted scenario document and its pure mutation operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::schema::{TableSchema, TableTemplate};
use crate::error::NarratorError;

/// Row cell values keyed by column name.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Rows per id letter before rolling over (`A999` is followed by `B1`).
const IDS_PER_LETTER: u64 = 999;

/// A single record. Persisted as `{ "id": ..., <field>: <value>, ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    #[serde(flatten)]
    pub fields: Fields,
}

/// A named table: immutable schema plus ordered rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub schema: TableSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guide: Option<String>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl Table {
    pub fn from_template(template: &TableTemplate) -> Self {
        Self {
            schema: template.schema.clone(),
            description: template.description.clone(),
            guide: template.guide.clone(),
            rows: Vec::new(),
        }
    }

    pub fn row(&self, id: &str) -> Option<&Row> {
        self.rows.iter().find(|r| r.id == id)
    }
}

/// Document-level bookkeeping persisted next to the tables.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Number of row ids handed out so far.
    #[serde(default)]
    pub rows_allocated: u64,
    /// Which assistant message (counted from the newest, 0-based) the
    /// workflow treats as the latest reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_message_offset: Option<usize>,
}

impl Metadata {
    fn allocate_row_id(&mut self) -> String {
        let index = self.rows_allocated;
        self.rows_allocated += 1;
        row_id_for(index)
    }
}

/// `0 -> A1`, `998 -> A999`, `999 -> B1`, `25 * 999 -> Z1`, `26 * 999 -> AA1`.
pub fn row_id_for(index: u64) -> String {
    let mut bucket = index / IDS_PER_LETTER;
    let number = index % IDS_PER_LETTER + 1;
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (bucket % 26) as u8) as char);
        if bucket < 26 {
            break;
        }
        bucket = bucket / 26 - 1;
    }
    letters.reverse();
    format!("{}{number}", letters.into_iter().collect::<String>())
}

/// One recorded change of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TableChange {
    TableCreated {
        table: String,
    },
    RowCreated {
        table: String,
        row_id: String,
        fields: Fields,
    },
    CellUpdated {
        table: String,
        row_id: String,
        field: String,
        old: serde_json::Value,
        new: serde_json::Value,
    },
    RowDeleted {
        table: String,
        row_id: String,
    },
    Reset,
}

/// Ordered log of the changes a run made.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDiff {
    pub changes: Vec<TableChange>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub(crate) fn push(&mut self, change: TableChange) {
        self.changes.push(change);
    }
}

/// The full persisted scenario: tables, summary text, bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub tables: BTreeMap<String, Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    /// A schema-only document built from templates.
    pub fn from_templates(templates: &[TableTemplate]) -> Result<Self, NarratorError> {
        let mut doc = Self::default();
        for template in templates {
            template.schema.check(&template.name)?;
            doc.tables
                .insert(template.name.clone(), Table::from_template(template));
        }
        Ok(doc)
    }

    /// Same tables and schemas, no rows, fresh bookkeeping, no summary.
    pub fn baseline(&self) -> Self {
        Self {
            tables: self
                .tables
                .iter()
                .map(|(name, table)| {
                    (
                        name.clone(),
                        Table {
                            rows: Vec::new(),
                            ..table.clone()
                        },
                    )
                })
                .collect(),
            summary: None,
            metadata: Metadata::default(),
        }
    }

    pub fn table(&self, name: &str) -> Result<&Table, NarratorError> {
        self.tables.get(name).ok_or_else(|| self.unknown_table(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, NarratorError> {
        if !self.tables.contains_key(name) {
            return Err(self.unknown_table(name));
        }
        self.tables
            .get_mut(name)
            .ok_or_else(|| NarratorError::InvalidState(format!("table '{name}' vanished")))
    }

    fn unknown_table(&self, name: &str) -> NarratorError {
        NarratorError::validation(format!(
            "unknown table '{name}'; tables are: {}",
            self.tables.keys().cloned().collect::<Vec<_>>().join(", ")
        ))
    }

    /// Create a table. Creating an existing table with the same schema is a
    /// no-op and returns `false`.
    pub fn create_table(
        &mut self,
        name: &str,
        schema: TableSchema,
    ) -> Result<bool, NarratorError> {
        schema.check(name)?;
        if let Some(existing) = self.tables.get(name) {
            if existing.schema == schema {
                return Ok(false);
            }
            return Err(NarratorError::validation(format!(
                "table '{name}' already exists with a different schema"
            )));
        }
        self.tables.insert(
            name.to_string(),
            Table {
                schema,
                description: None,
                guide: None,
                rows: Vec::new(),
            },
        );
        Ok(true)
    }

    pub fn create_row(&mut self, table: &str, fields: Fields) -> Result<String, NarratorError> {
        self.table(table)?.schema.check_new_row(table, &fields)?;
        let id = self.metadata.allocate_row_id();
        self.table_mut(table)?.rows.push(Row {
            id: id.clone(),
            fields,
        });
        Ok(id)
    }

    /// Set one cell; returns the previous value (`Null` when unset).
    pub fn update_cell(
        &mut self,
        table: &str,
        row_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Value, NarratorError> {
        let t = self.table_mut(table)?;
        t.schema.check_cell(table, field, &value)?;
        let row = t
            .rows
            .iter_mut()
            .find(|r| r.id == row_id)
            .ok_or_else(|| {
                NarratorError::validation(format!("table '{table}' has no row '{row_id}'"))
            })?;
        let old = if value.is_null() {
            row.fields.remove(field)
        } else {
            row.fields.insert(field.to_string(), value)
        };
        Ok(old.unwrap_or(serde_json::Value::Null))
    }

    pub fn delete_row(&mut self, table: &str, row_id: &str) -> Result<Row, NarratorError> {
        let t = self.table_mut(table)?;
        let pos = t.rows.iter().position(|r| r.id == row_id).ok_or_else(|| {
            NarratorError::validation(format!("table '{table}' has no row '{row_id}'"))
        })?;
        Ok(t.rows.remove(pos))
    }

    pub fn reset(&mut self) {
        *self = self.baseline();
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }
}
