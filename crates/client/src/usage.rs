//! Usage recorders.

use std::sync::Mutex;

use async_trait::async_trait;
use parley_core::{UsageRecord, UsageRecorder};
use tracing::info;

/// Writes each record to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageRecorder;

#[async_trait]
impl UsageRecorder for TracingUsageRecorder {
    async fn record(&self, record: UsageRecord) -> parley_core::Result<()> {
        info!(
            model = %record.model,
            context = %record.context,
            conversation_id = record.conversation_id.as_deref().unwrap_or("-"),
            prompt_tokens = record.prompt_tokens,
            completion_tokens = record.completion_tokens,
            "Token usage"
        );
        Ok(())
    }
}

/// Keeps records in memory. Useful for tests and session summaries.
#[derive(Debug, Default)]
pub struct InMemoryUsageRecorder {
    records: Mutex<Vec<UsageRecord>>,
}

impl InMemoryUsageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// `(prompt, completion)` totals across all records.
    pub fn totals(&self) -> (usize, usize) {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .fold((0, 0), |(p, c), r| (p + r.prompt_tokens, c + r.completion_tokens))
    }
}

#[async_trait]
impl UsageRecorder for InMemoryUsageRecorder {
    async fn record(&self, record: UsageRecord) -> parley_core::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}
