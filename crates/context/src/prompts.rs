//! Prompt templates for summarization and title generation.

use parley_core::{Message, Role};

/// Character limit applied to title inputs.
pub const MAX_TEXT_CHARS: usize = 40_000;

/// Appended to text cut by [`truncate_text`].
pub const TRUNCATION_SUFFIX: &str = "... [text truncated for brevity]";

/// Joins the kept head and tail of an oversized message.
pub const TRUNCATION_MARKER: &str = "\n...[truncated]...\n";

/// Progressive summary of new conversation lines onto a running summary.
pub const SUMMARY_PROMPT: &str = "Progressively summarize the lines of conversation provided, \
adding onto the previous summary and returning a new summary. Keep names, decisions, open \
questions and any facts the conversation depends on.

EXAMPLE
Current summary:
The user asks what the assistant thinks of unit tests. The assistant thinks they are worth writing.

New lines of conversation:
User: Why are they worth writing?
Assistant: Because they catch regressions before users do.

New summary:
The user asks what the assistant thinks of unit tests. The assistant thinks they are worth writing because they catch regressions before users do.
END OF EXAMPLE

Current summary:
{summary}

New lines of conversation:
{new_lines}

New summary:";

/// Used when only a cut-down version of the latest message fits.
pub const CUT_OFF_PROMPT: &str = "The following text is cut-off:
{new_lines}

Summarize the content as best as you can, noting that it was cut-off.

Summary:";

/// Instruction for the plain completion title strategy.
pub const TITLE_PROMPT: &str = "Detect user language and write in the same language an extremely \
concise title for this conversation, which you must accurately detect.
Write in the detected language. Title in 5 Words or Less. No Punctuation or Quotation. Do not \
mention the language. All first letters of every word should be capitalized and write the title \
in User Language only.

{convo}

||>Title:";

/// Instruction for the structured title strategy.
pub const STRUCTURED_TITLE_PROMPT: &str = "Write a concise title for the conversation below, in \
the language the user writes in. Five words or less, no punctuation or quotation marks.

Respond with a single JSON object and nothing else, of the form {\"title\": \"...\"}.

{convo}";

/// Which summarization template a request uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryTemplate {
    Progressive,
    CutOff,
}

/// Cut `text` to [`MAX_TEXT_CHARS`] characters, marking the cut.
pub fn truncate_text(text: &str) -> String {
    match text.char_indices().nth(MAX_TEXT_CHARS) {
        Some((byte_idx, _)) => format!("{}{TRUNCATION_SUFFIX}", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// `Label: content` lines for the summarizer.
pub fn buffer_lines(messages: &[Message], user_label: &str, assistant_label: &str) -> String {
    messages
        .iter()
        .map(|m| {
            let label = match m.role {
                Role::User => user_label,
                Role::Assistant => assistant_label,
                Role::System => "System",
            };
            format!("{label}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_summary_prompt(
    template: SummaryTemplate,
    new_lines: &str,
    previous_summary: Option<&str>,
) -> String {
    match template {
        SummaryTemplate::Progressive => SUMMARY_PROMPT
            .replace("{summary}", previous_summary.unwrap_or_default())
            .replace("{new_lines}", new_lines),
        SummaryTemplate::CutOff => CUT_OFF_PROMPT.replace("{new_lines}", new_lines),
    }
}

/// The exchange a title is generated from.
pub fn title_convo(text: &str, response: &str) -> String {
    let response = serde_json::to_string(&truncate_text(response)).unwrap_or_default();
    format!(
        "||>User:\n\"{}\"\n||>Response:\n\"{response}\"",
        truncate_text(text)
    )
}

pub fn render_title_prompt(convo: &str) -> String {
    TITLE_PROMPT.replace("{convo}", convo)
}

pub fn render_structured_title_prompt(convo: &str) -> String {
    STRUCTURED_TITLE_PROMPT.replace("{convo}", convo)
}
