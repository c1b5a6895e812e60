//! Message and Conversation domain types.
//!
//! These are the value objects that flow through the whole client:
//! history provider supplies messages → assembler budgets them → provider replies.
//!
//! The core never mutates a message except to attach its computed `token_count`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions and synthetic summaries
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Optional sender label, sent to the provider as `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The text content
    pub content: String,

    /// Token count, computed lazily and cached by the assembler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,

    /// Image attachments, sent as `image_url` parts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_refs: Vec<String>,

    /// Link to the previous message in the conversation chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,

    /// Running summary of everything up to and including this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Token count of `summary`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_token_count: Option<usize>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            name: None,
            content: content.into(),
            token_count: None,
            image_refs: Vec::new(),
            parent_message_id: None,
            summary: None,
            summary_token_count: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent_message_id: impl Into<String>) -> Self {
        self.parent_message_id = Some(parent_message_id.into());
        self
    }

    pub fn with_token_count(mut self, tokens: usize) -> Self {
        self.token_count = Some(tokens);
        self
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_refs.push(url.into());
        self
    }
}

/// A conversation is a parent-linked set of messages with shared context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: String,

    /// Messages in insertion order; the chain itself lives in `parent_message_id`
    pub messages: Vec<Message>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added
    pub updated_at: DateTime<Utc>,

    /// Optional title (auto-generated or user-set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            title: None,
        }
    }

    /// Append a message, linking it to the current tail.
    pub fn push(&mut self, mut message: Message) {
        if message.parent_message_id.is_none() {
            message.parent_message_id = self.messages.last().map(|m| m.id.clone());
        }
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// The id of the most recently added message.
    pub fn tail_id(&self) -> Option<&str> {
        self.messages.last().map(|m| m.id.as_str())
    }

    /// Oldest-first history ending at the current tail.
    pub fn history(&self, stop_at_summary: bool) -> Vec<Message> {
        match self.tail_id() {
            Some(tail) => Self::linearize(&self.messages, tail, stop_at_summary),
            None => Vec::new(),
        }
    }

    /// Walk the parent chain from `leaf_id` to the root and return it oldest-first.
    ///
    /// With `stop_at_summary`, the walk ends at the first message carrying a stored
    /// summary; that message is returned as a system message holding the summary
    /// text (and its summary token count), so the assembler sees the summary in
    /// place of everything it covers.
    ///
    /// Missing parents end the walk; cycles are cut at the first revisit.
    pub fn linearize(messages: &[Message], leaf_id: &str, stop_at_summary: bool) -> Vec<Message> {
        let by_id: HashMap<&str, &Message> =
            messages.iter().map(|m| (m.id.as_str(), m)).collect();

        let mut chain = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut cursor = Some(leaf_id);

        while let Some(id) = cursor {
            if !seen.insert(id) {
                break;
            }
            let Some(message) = by_id.get(id) else {
                break;
            };

            if stop_at_summary {
                if let Some(summary) = &message.summary {
                    let mut folded = (*message).clone();
                    folded.role = Role::System;
                    folded.name = None;
                    folded.content = summary.clone();
                    folded.token_count = message.summary_token_count;
                    folded.image_refs.clear();
                    chain.push(folded);
                    break;
                }
            }

            chain.push((*message).clone());
            cursor = message.parent_message_id.as_deref();
        }

        chain.reverse();
        chain
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
