//! Completion state machine.
//!
//! ```text
//! Idle -> Requesting -> (Streaming | NonStreaming) -> {Completed | Aborted | Failed}
//! ```
//!
//! The accumulator owns the partial reply and everything learned from the
//! chunks (role, finish reason, usage). Whether the terminal message is well
//! formed is decided by [`StreamAccumulator::finish`], so the anomaly path can
//! be tested without a network.

use parley_core::{ProviderError, Role, StreamChunk, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Requesting,
    Streaming,
    NonStreaming,
    Completed,
    Aborted,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

/// A stream that ended without a well-formed assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAnomaly {
    MissingRole,
    UnexpectedRole(Role),
    MissingFinishReason,
}

impl StreamAnomaly {
    /// The protocol error this anomaly is reported as.
    pub fn into_error(self) -> ProviderError {
        let message = match self {
            Self::MissingRole => "missing role for choice 0".to_string(),
            Self::UnexpectedRole(role) => format!(
                "Invalid final message: expected final message to include role=assistant, got role={role}"
            ),
            Self::MissingFinishReason => "missing finish_reason for choice 0".to_string(),
        };
        ProviderError::Protocol(message)
    }
}

#[derive(Debug)]
pub struct StreamAccumulator {
    phase: Phase,
    reply: String,
    role: Option<Role>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    chunks: usize,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            reply: String::new(),
            role: None,
            finish_reason: None,
            usage: None,
            chunks: 0,
        }
    }

    pub fn begin_request(&mut self) {
        if self.phase == Phase::Idle {
            self.phase = Phase::Requesting;
        }
    }

    pub fn open_stream(&mut self) {
        if self.phase == Phase::Requesting {
            self.phase = Phase::Streaming;
        }
    }

    pub fn begin_non_streaming(&mut self) {
        if self.phase == Phase::Requesting {
            self.phase = Phase::NonStreaming;
        }
    }

    /// Fold a chunk in. Returns the text delta, if any.
    pub fn push<'c>(&mut self, chunk: &'c StreamChunk) -> Option<&'c str> {
        if self.phase.is_terminal() {
            return None;
        }
        self.chunks += 1;
        if self.role.is_none() {
            self.role = chunk.role;
        }
        if chunk.finish_reason.is_some() {
            self.finish_reason.clone_from(&chunk.finish_reason);
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        let text = chunk.content.as_deref().filter(|t| !t.is_empty())?;
        self.reply.push_str(text);
        Some(text)
    }

    /// Close a successful request, checking the terminal message.
    ///
    /// Role and finish reason are only required of streamed replies.
    pub fn finish(&mut self) -> Result<(), StreamAnomaly> {
        if self.phase == Phase::Streaming {
            let anomaly = match self.role {
                None => Some(StreamAnomaly::MissingRole),
                Some(Role::Assistant) if self.finish_reason.is_none() => {
                    Some(StreamAnomaly::MissingFinishReason)
                }
                Some(Role::Assistant) => None,
                Some(role) => Some(StreamAnomaly::UnexpectedRole(role)),
            };
            if let Some(anomaly) = anomaly {
                self.phase = Phase::Failed;
                return Err(anomaly);
            }
        }
        self.phase = Phase::Completed;
        Ok(())
    }

    pub fn abort(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Aborted;
        }
    }

    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Failed;
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reply(&self) -> &str {
        &self.reply
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }
}
