//! Text and JSON renderings of a document for prompts and directives.

use std::fmt::Write;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::document::{Document, Table};

/// Layout of the tables inside stage prompts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TableFormat {
    /// Pipe-delimited rows, as injected into the chat.
    #[default]
    Text,
    /// `{ table: [ {id, ...fields} ] }`.
    Json,
}

const EMPTY_CELL: &str = "-";

fn cell_text(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => EMPTY_CELL.to_string(),
        Some(serde_json::Value::String(s)) if s.is_empty() => EMPTY_CELL.to_string(),
        Some(serde_json::Value::String(s)) => s.replace('|', "/").replace('\n', " "),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| cell_text(Some(v)))
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => other.to_string(),
    }
}

fn render_table(out: &mut String, name: &str, table: &Table) {
    let _ = write!(out, "## {name}");
    if let Some(description) = &table.description {
        let _ = write!(out, " ({description})");
    }
    out.push('\n');
    let columns: Vec<&str> = table.schema.column_names().collect();
    let _ = writeln!(out, "id | {}", columns.join(" | "));
    if table.rows.is_empty() {
        out.push_str("(no rows)\n");
        return;
    }
    for row in &table.rows {
        let cells: Vec<String> = columns.iter().map(|c| cell_text(row.fields.get(*c))).collect();
        let _ = writeln!(out, "{} | {}", row.id, cells.join(" | "));
    }
}

/// Pipe-delimited rendering of every table.
pub fn tables_text(doc: &Document) -> String {
    let mut out = String::new();
    for (i, (name, table)) in doc.tables.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        render_table(&mut out, name, table);
    }
    out
}

/// Tables with their columns and editing guides, for the update prompt.
pub fn schema_text(doc: &Document) -> String {
    let mut out = String::new();
    for (name, table) in &doc.tables {
        let columns: Vec<String> = table
            .schema
            .columns()
            .iter()
            .map(|c| {
                if c.required {
                    format!("{} (required)", c.name)
                } else {
                    c.name.clone()
                }
            })
            .collect();
        let _ = writeln!(out, "- {name}: {}", columns.join(", "));
        if let Some(guide) = &table.guide {
            let _ = writeln!(out, "  guide: {guide}");
        }
    }
    out
}

/// Summary followed by all tables; what gets injected into the chat.
pub fn scenario_text(doc: &Document) -> String {
    let mut out = String::new();
    if let Some(summary) = doc.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push_str(summary.trim());
        out.push_str("\n\n");
    }
    out.push_str(&tables_text(doc));
    out
}

/// Compact JSON for tools: `{ table: [ {id, ...fields} ] }`.
pub fn tables_json(doc: &Document) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = doc
        .tables
        .iter()
        .map(|(name, table)| {
            (
                name.clone(),
                serde_json::to_value(&table.rows).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

/// Summary followed by the tables in `format`, for stage prompts.
pub fn prompt_scenario(doc: &Document, format: TableFormat) -> String {
    match format {
        TableFormat::Text => scenario_text(doc),
        TableFormat::Json => {
            let mut out = String::new();
            if let Some(summary) = doc.summary.as_deref().filter(|s| !s.trim().is_empty()) {
                let _ = writeln!(out, "{}\n", summary.trim());
            }
            let _ = writeln!(out, "{:#}", tables_json(doc));
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::{TableSchema, TableTemplate};
    use serde_json::json;

    fn doc() -> Document {
        let mut doc = Document::from_templates(&[TableTemplate::new(
            "characters",
            TableSchema::new([("name", true), ("traits", false)]),
        )
        .described("Cast", "One row per character.")])
        .unwrap();
        doc.create_row(
            "characters",
            json!({ "name": "Ember", "traits": ["scaled", "fire|breath"] })
                .as_object()
                .cloned()
                .unwrap(),
        )
        .unwrap();
        doc
    }

    #[test]
    fn tables_text_renders_rows_with_placeholders() {
        let text = tables_text(&doc());
        assert_eq!(
            text,
            "## characters (Cast)\nid | name | traits\nA1 | Ember | scaled, fire/breath\n"
        );
    }

    #[test]
    fn json_prompt_lists_rows_by_table() {
        let mut d = doc();
        d.summary = Some("Ember sleeps.".into());

        let text = prompt_scenario(&d, TableFormat::Json);

        let (summary, tables) = text.split_once("\n\n").unwrap();
        assert_eq!(summary, "Ember sleeps.");
        let tables: serde_json::Value = serde_json::from_str(tables).unwrap();
        assert_eq!(tables["characters"][0]["id"], json!("A1"));
        assert_eq!(tables["characters"][0]["name"], json!("Ember"));
        assert_eq!(prompt_scenario(&d, TableFormat::Text), scenario_text(&d));
    }

    #[test]
    fn empty_table_is_marked() {
        let mut d = doc();
        d.reset();
        assert!(tables_text(&d).contains("(no rows)"));
    }

    #[test]
    fn scenario_text_puts_summary_first() {
        let mut d = doc();
        d.summary = Some("The party camps by the river.".into());
        assert!(scenario_text(&d).starts_with("The party camps by the river.\n\n## characters"));
    }

    #[test]
    fn schema_text_lists_required_columns_and_guides() {
        let text = schema_text(&doc());
        assert!(text.contains("- characters: name (required), traits"));
        assert!(text.contains("guide: One row per character."));
    }
}
