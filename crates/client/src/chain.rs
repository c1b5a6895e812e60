//! Ordered strategy chains with a uniform result contract.
//!
//! Each strategy resolves to an [`Outcome`]. The chain returns the first
//! success, moves on after a recoverable failure, and stops at a fatal one.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::ClientError;

/// Tagged result shared by strategy chains and completion error handling.
#[derive(Debug)]
pub enum Outcome<T, E> {
    Success(T),
    /// Failed, but a fallback may still produce a result
    Recoverable(E),
    /// Failed; no fallback should be attempted
    Fatal(E),
}

/// One way of producing a `T` from an `I`.
#[async_trait]
pub trait Strategy<I: Sync + ?Sized, T: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt(&self, input: &I) -> Outcome<T, ClientError>;
}

/// Strategies tried in order.
pub struct StrategyChain<I: Sync + ?Sized, T: Send> {
    label: String,
    strategies: Vec<Box<dyn Strategy<I, T>>>,
}

impl<I: Sync + ?Sized, T: Send> StrategyChain<I, T> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            strategies: Vec::new(),
        }
    }

    pub fn with(mut self, strategy: impl Strategy<I, T> + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Run the chain. Exhausting it is reported as `Recoverable`.
    pub async fn run(&self, input: &I) -> Outcome<T, ClientError> {
        let mut last_error = None;

        for (i, strategy) in self.strategies.iter().enumerate() {
            info!(
                chain = %self.label,
                strategy = strategy.name(),
                attempt = i + 1,
                total = self.strategies.len(),
                "Trying strategy"
            );

            match strategy.attempt(input).await {
                Outcome::Success(value) => return Outcome::Success(value),
                Outcome::Recoverable(e) => {
                    warn!(
                        chain = %self.label,
                        strategy = strategy.name(),
                        error = %e,
                        "Strategy failed, trying next"
                    );
                    last_error = Some(e);
                }
                Outcome::Fatal(e) => {
                    debug!(chain = %self.label, strategy = strategy.name(), error = %e, "Strategy chain stopped");
                    return Outcome::Fatal(e);
                }
            }
        }

        Outcome::Recoverable(last_error.unwrap_or_else(|| ClientError::Exhausted(self.label.clone())))
    }
}
