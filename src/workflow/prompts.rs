//! Stage prompts.

use std::fmt::Write;

pub const MEMORY_SYSTEM_PROMPT: &str = "\
You are the memory keeper of an ongoing role-play. Before the scenario is \
updated, recall what earlier turns established about the people, places and \
objects in the latest reply.

Use search_history with linked patterns (A.*?B|B.*?A) rather than long word \
lists. Use lookup_external_knowledge only for real-world terms. Use think to \
plan. When done, answer with a short note of the relevant facts and where \
they came from. Do not invent facts.";

pub const UPDATE_SYSTEM_PROMPT: &str = "\
You maintain the world state of an ongoing role-play as structured tables.

Compare the latest reply with the current tables. Record new entities with \
create_row, change facts with update_cell and remove what no longer exists \
with delete_row. Never create a row for an entity that already has one; \
update it instead. Keep cells short.

When the tables are correct, answer with a concise summary of the current \
scene (where, who, what is happening). That answer replaces the previous \
summary.";

pub const NO_SCENARIO: &str = "[no scenario yet]";
pub const NO_MESSAGE: &str = "[no assistant message yet]";
pub const NO_MEMORY: &str = "[no memory note]";
/// Memory note used when the memory stage fails.
pub const MEMORY_UNAVAILABLE: &str = "Memory search failed; no earlier facts could be recalled.";

fn or_placeholder<'a>(text: &'a str, placeholder: &'a str) -> &'a str {
    if text.trim().is_empty() {
        placeholder
    } else {
        text
    }
}

pub fn memory_user_prompt(scenario: &str, last_ai_message: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "<current_scenario>\n{}\n</current_scenario>\n", or_placeholder(scenario, NO_SCENARIO));
    let _ = write!(out, "<latest_reply>\n{}\n</latest_reply>", or_placeholder(last_ai_message, NO_MESSAGE));
    out
}

pub fn memory_note(text: &str) -> String {
    format!("<memory_flashback>\n{}\n</memory_flashback>", or_placeholder(text.trim(), NO_MEMORY))
}

pub fn update_user_prompt(
    scenario: &str,
    schema: &str,
    last_ai_message: &str,
    memory: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "<table_schema>\n{}</table_schema>\n", schema);
    let _ = writeln!(out, "<current_scenario>\n{}\n</current_scenario>\n", or_placeholder(scenario, NO_SCENARIO));
    let _ = writeln!(out, "{}\n", or_placeholder(memory, NO_MEMORY));
    let _ = write!(out, "<latest_reply>\n{}\n</latest_reply>", or_placeholder(last_ai_message, NO_MESSAGE));
    out
}
