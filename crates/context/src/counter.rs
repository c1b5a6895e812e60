//! Per-message token accounting for the active model.

use std::sync::Arc;

use parley_core::{Message, ModelProfile, TokenizationError};

use crate::tokenizer::{EncodingSelector, TokenizerCache};

/// Model whose chat format charges an extra token per message and refunds one per name.
const LEGACY_TURBO_MODEL: &str = "gpt-3.5-turbo-0301";

/// Counts tokens with the encoding selected for one model.
#[derive(Debug, Clone)]
pub struct TokenCounter {
    cache: Arc<TokenizerCache>,
    selector: EncodingSelector,
    model: String,
}

impl TokenCounter {
    pub fn new(cache: Arc<TokenizerCache>, profile: &ModelProfile) -> Self {
        Self {
            cache,
            selector: EncodingSelector::for_profile(profile),
            model: profile.model().to_string(),
        }
    }

    pub fn with_selector(
        cache: Arc<TokenizerCache>,
        selector: EncodingSelector,
        model: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            selector,
            model: model.into(),
        }
    }

    pub fn selector(&self) -> &EncodingSelector {
        &self.selector
    }

    pub fn cache(&self) -> &Arc<TokenizerCache> {
        &self.cache
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn count_text(&self, text: &str) -> Result<usize, TokenizationError> {
        self.cache.count(text, &self.selector)
    }

    /// Tokens a message occupies in a chat request.
    ///
    /// 3 tokens of framing per message plus the role, content and name, and
    /// one more token when a name is present.
    pub fn count_message(&self, message: &Message) -> Result<usize, TokenizationError> {
        let (per_message, per_name): (isize, isize) = if self.model == LEGACY_TURBO_MODEL {
            (4, -1)
        } else {
            (3, 1)
        };

        let mut total = per_message;
        total += self.count_text(message.role.as_str())? as isize;
        total += self.count_text(&message.content)? as isize;
        if let Some(name) = &message.name {
            total += self.count_text(name)? as isize + per_name;
        }
        Ok(total.max(0) as usize)
    }

    /// Completion tokens for a reply.
    pub fn count_response(&self, text: &str) -> Result<usize, TokenizationError> {
        self.count_message(&Message::assistant(text))
    }

    /// Count and store the message's tokens unless already present.
    pub fn ensure_counted(&self, message: &mut Message) -> Result<usize, TokenizationError> {
        if let Some(count) = message.token_count {
            return Ok(count);
        }
        let count = self.count_message(message)?;
        message.token_count = Some(count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::WordFactory;

    fn word_counter(model: &str) -> TokenCounter {
        let cache = Arc::new(TokenizerCache::with_factory(Arc::new(WordFactory::default())));
        TokenCounter::with_selector(cache, EncodingSelector::Chat, model)
    }

    #[test]
    fn message_framing() {
        let counter = word_counter("gpt-4");
        // 3 framing + 1 role + 3 content
        assert_eq!(counter.count_message(&Message::user("one two three")).unwrap(), 7);
        // + 1 name word + 1 per name
        let named = Message::user("one two three").with_name("Ada");
        assert_eq!(counter.count_message(&named).unwrap(), 9);
    }

    #[test]
    fn legacy_turbo_framing() {
        let counter = word_counter(LEGACY_TURBO_MODEL);
        assert_eq!(counter.count_message(&Message::user("one two three")).unwrap(), 8);
        let named = Message::user("one two three").with_name("Ada");
        assert_eq!(counter.count_message(&named).unwrap(), 8);
    }

    #[test]
    fn ensure_counted_is_idempotent() {
        let counter = word_counter("gpt-4");
        let mut message = Message::user("a b").with_token_count(42);
        assert_eq!(counter.ensure_counted(&mut message).unwrap(), 42);

        let mut fresh = Message::user("a b");
        assert_eq!(counter.ensure_counted(&mut fresh).unwrap(), 6);
        assert_eq!(fresh.token_count, Some(6));
    }

    #[test]
    fn response_counts_as_assistant_message() {
        let cache = Arc::new(TokenizerCache::new());
        let counter = TokenCounter::with_selector(cache, EncodingSelector::Chat, "gpt-4");
        let text = "Sure, here you go.";
        let expected = 3 + counter.count_text("assistant").unwrap() + counter.count_text(text).unwrap();
        assert_eq!(counter.count_response(text).unwrap(), expected);
    }
}
