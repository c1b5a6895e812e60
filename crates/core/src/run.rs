//! Per-request run state.

use tokio_util::sync::CancellationToken;

/// State owned by one completion invocation.
///
/// The cancellation token is shared with whoever may abort the request;
/// everything else is written only by the request's own call stack.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub cancel: CancellationToken,
    /// Text accumulated so far, delivered even when the run is aborted
    pub partial_reply: String,
    pub finish_reason: Option<String>,
    /// The error recorded against this run, if any
    pub error: Option<String>,
    pub conversation_id: Option<String>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A run controlled by an externally owned token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn for_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }
}
