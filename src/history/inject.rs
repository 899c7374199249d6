use crate::types::{ChatMessage, Role};

pub const SCENARIO_OPEN: &str = "<current_scenario>";
pub const SCENARIO_CLOSE: &str = "</current_scenario>";

/// How [`inject_scenario`] picks its target and trims history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectOptions {
    /// Assistant turns kept before the target user message; 0 keeps all.
    pub max_history_length: usize,
    /// Which user message receives the scenario, counted from the newest
    /// (0 = newest).
    pub ai_message_offset: usize,
}

impl Default for InjectOptions {
    fn default() -> Self {
        Self {
            max_history_length: 20,
            ai_message_offset: 0,
        }
    }
}

/// Prepend the scenario to the target user message and trim old history.
///
/// System messages (and a leading user message, which some clients use as
/// a system prompt) are kept in front untouched. When the offset points
/// past the oldest user message the newest user message is used instead.
/// A blank scenario only trims.
pub fn inject_scenario(
    messages: &[ChatMessage],
    scenario: &str,
    options: InjectOptions,
) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return Vec::new();
    }

    let (mut head, mut rest): (Vec<ChatMessage>, Vec<ChatMessage>) = (Vec::new(), Vec::new());
    for (i, msg) in messages.iter().enumerate() {
        if msg.role == Role::System || (i == 0 && msg.role == Role::User) {
            head.push(msg.clone());
        } else {
            rest.push(msg.clone());
        }
    }

    let mut target = rest
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, m)| m.role == Role::User)
        .nth(options.ai_message_offset)
        .map(|(i, _)| i);

    if let (Some(t), n) = (target, options.max_history_length) {
        if n > 0 {
            let cutoff = rest[..t]
                .iter()
                .enumerate()
                .rev()
                .filter(|(_, m)| m.role == Role::Assistant)
                .nth(n - 1)
                .map(|(i, _)| i);
            if let Some(cutoff) = cutoff.filter(|&c| c > 0) {
                rest.drain(..cutoff);
                target = Some(t - cutoff);
            }
        }
    }

    if !scenario.trim().is_empty() {
        let target = target.or_else(|| rest.iter().rposition(|m| m.role == Role::User));
        if let Some(t) = target {
            let msg = &mut rest[t];
            msg.content =
                format!("{SCENARIO_OPEN}\n{scenario}\n{SCENARIO_CLOSE}\n\n{}", msg.content);
        }
    }

    head.extend(rest);
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn conversation(turns: usize) -> Vec<ChatMessage> {
        let mut out = vec![ChatMessage::system("sys")];
        for i in 0..turns {
            out.push(ChatMessage::user(format!("u{i}")));
            out.push(ChatMessage::assistant(format!("a{i}")));
        }
        out.push(ChatMessage::user("latest"));
        out
    }

    #[test]
    fn scenario_goes_before_newest_user_message() {
        let out = inject_scenario(&conversation(2), "the forest", InjectOptions::default());

        assert_eq!(out.len(), 6);
        assert_eq!(
            out.last().unwrap().content,
            "<current_scenario>\nthe forest\n</current_scenario>\n\nlatest"
        );
        assert_eq!(out[0], ChatMessage::system("sys"));
    }

    #[test]
    fn offset_targets_older_user_message() {
        let options = InjectOptions {
            max_history_length: 0,
            ai_message_offset: 1,
        };
        let out = inject_scenario(&conversation(2), "S", options);

        assert!(out[3].content.starts_with(SCENARIO_OPEN));
        assert!(out[3].content.ends_with("u1"));
        assert_eq!(out[5].content, "latest");
    }

    #[test]
    fn history_is_trimmed_to_assistant_turn_budget() {
        let options = InjectOptions {
            max_history_length: 2,
            ai_message_offset: 0,
        };
        let out = inject_scenario(&conversation(5), "S", options);

        let contents: Vec<&str> = out.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents[..4], ["sys", "a3", "u4", "a4"]);
        assert!(contents[4].ends_with("latest"));
    }

    #[test]
    fn offset_past_oldest_user_falls_back_to_newest() {
        let options = InjectOptions {
            max_history_length: 20,
            ai_message_offset: 9,
        };
        let out = inject_scenario(&conversation(1), "S", options);
        assert!(out.last().unwrap().content.starts_with(SCENARIO_OPEN));
    }

    #[test]
    fn leading_user_message_is_treated_as_system_prompt() {
        let messages = vec![ChatMessage::user("persona"), ChatMessage::assistant("hi")];
        let out = inject_scenario(&messages, "S", InjectOptions::default());
        assert_eq!(out, messages);
    }

    #[test]
    fn blank_scenario_leaves_messages_untouched() {
        let messages = conversation(1);
        assert_eq!(inject_scenario(&messages, "  ", InjectOptions::default()), messages);
    }
}
