//! Table schemas and the default table templates.

use serde::{Deserialize, Serialize};

use super::document::Fields;
use crate::error::NarratorError;

/// Reserved key holding the row identifier in persisted rows.
pub const ROW_ID_KEY: &str = "id";

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

/// Ordered column list of a table. Immutable once the table exists.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema {
    columns: Vec<ColumnSpec>,
}

impl TableSchema {
    /// Build from `(name, required)` pairs.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, required)| ColumnSpec {
                    name: name.into(),
                    required,
                })
                .collect(),
        }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Reject empty, duplicate, or reserved column names.
    pub fn check(&self, table: &str) -> Result<(), NarratorError> {
        if self.columns.is_empty() {
            return Err(NarratorError::validation(format!(
                "table '{table}' needs at least one column"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(NarratorError::validation(format!(
                    "table '{table}' has an empty column name"
                )));
            }
            if column.name == ROW_ID_KEY {
                return Err(NarratorError::validation(format!(
                    "table '{table}': column name '{ROW_ID_KEY}' is reserved"
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(NarratorError::validation(format!(
                    "table '{table}' declares column '{}' twice",
                    column.name
                )));
            }
        }
        Ok(())
    }

    /// Validate a full set of fields for a new row.
    pub fn check_new_row(&self, table: &str, fields: &Fields) -> Result<(), NarratorError> {
        for (key, value) in fields {
            self.check_cell(table, key, value)?;
        }
        for column in self.columns.iter().filter(|c| c.required) {
            match fields.get(&column.name) {
                None | Some(serde_json::Value::Null) => {
                    return Err(NarratorError::validation(format!(
                        "table '{table}': required field '{}' is missing",
                        column.name
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Validate a single cell write.
    pub fn check_cell(
        &self,
        table: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<(), NarratorError> {
        let Some(column) = self.column(field) else {
            return Err(NarratorError::validation(format!(
                "table '{table}' has no field '{field}'; fields are: {}",
                self.column_names().collect::<Vec<_>>().join(", ")
            )));
        };
        if value.is_object() {
            return Err(NarratorError::validation(format!(
                "table '{table}': field '{field}' must hold a scalar or a list, not an object"
            )));
        }
        if column.required && value.is_null() {
            return Err(NarratorError::validation(format!(
                "table '{table}': required field '{field}' cannot be null"
            )));
        }
        Ok(())
    }
}

/// A table definition used to seed a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTemplate {
    pub name: String,
    pub schema: TableSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Instructions for the model on when and how to edit the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guide: Option<String>,
}

impl TableTemplate {
    pub fn new(name: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            description: None,
            guide: None,
        }
    }

    pub fn described(mut self, description: impl Into<String>, guide: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self.guide = Some(guide.into());
        self
    }
}

/// The stock world-state tables.
pub fn default_templates() -> Vec<TableTemplate> {
    vec![
        TableTemplate::new(
            "scenes",
            TableSchema::new([
                ("time", false),
                ("location", false),
                ("event", true),
                ("participants", false),
                ("notes", false),
            ]),
        )
        .described(
            "Timeline of significant events in the story.",
            "Add a row when a scene ends or a notable event happens. Keep entries short; merge minor beats into the last row.",
        ),
        TableTemplate::new(
            "characters",
            TableSchema::new([
                ("name", true),
                ("identity", false),
                ("traits", false),
                ("relationships", false),
                ("notes", false),
            ]),
        )
        .described(
            "Every named character, creature, or faction that has appeared.",
            "Add a row the first time a character appears. Update cells when facts change; never create a second row for the same character.",
        ),
        TableTemplate::new(
            "character_status",
            TableSchema::new([
                ("name", true),
                ("location", false),
                ("condition", false),
                ("action", false),
                ("mood", false),
            ]),
        )
        .described(
            "Current situation of characters present in the scene.",
            "Keep one row per active character and overwrite it as the scene moves on. Delete rows for characters who left the story.",
        ),
        TableTemplate::new(
            "key_entities",
            TableSchema::new([
                ("name", true),
                ("category", false),
                ("key_info", false),
                ("notes", false),
            ]),
        )
        .described(
            "Important places, items, and concepts.",
            "Record items, locations, and lore the characters interact with. Update the owner or state of items as they change hands.",
        ),
        TableTemplate::new("world", TableSchema::new([("topic", true), ("knowledge", true)]))
            .described(
                "Established facts about the setting.",
                "Add a row when the story establishes a rule of the world. Do not record speculation.",
            ),
    ]
}
