//! Message formatting before counting and sending.

use parley_core::{Message, Role};

const MAX_NAME_LEN: usize = 64;

/// Sanitize a participant name to `[A-Za-z0-9_-]{1,64}`.
///
/// Invalid characters become `_`. Returns `None` for an empty name.
pub fn sanitize_name(name: &str) -> Option<String> {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    (!sanitized.is_empty()).then_some(sanitized)
}

/// Attach the configured labels as names and sanitize them.
///
/// A user label replaces the name of user messages and an assistant label the
/// name of assistant messages; system messages keep their own name.
pub fn format_message(
    message: &Message,
    user_label: Option<&str>,
    assistant_label: Option<&str>,
) -> Message {
    let mut formatted = message.clone();
    let label = match formatted.role {
        Role::User => user_label,
        Role::Assistant => assistant_label,
        Role::System => None,
    };
    if let Some(label) = label {
        formatted.name = Some(label.to_string());
    }
    formatted.name = formatted.name.as_deref().and_then(sanitize_name);
    formatted
}

/// System message carrying the prompt prefix, or `None` if it is blank.
pub fn instructions_message(prompt_prefix: &str) -> Option<Message> {
    let prefix = prompt_prefix.trim();
    if prefix.is_empty() {
        return None;
    }
    Some(Message::system(format!("Instructions:\n{prefix}")).with_name("instructions"))
}
