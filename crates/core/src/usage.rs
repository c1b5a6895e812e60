//! Usage recording seam.
//!
//! Called after a successful completion. Failures are logged by the caller and
//! never fail the completion itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One completed request's token usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// "message", "title", "summary"
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        prompt_tokens: usize,
        completion_tokens: usize,
        model: impl Into<String>,
        conversation_id: Option<String>,
    ) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            model: model.into(),
            conversation_id,
            context: "message".into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<()>;
}
