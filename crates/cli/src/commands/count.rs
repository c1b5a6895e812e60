//! `parley count`: Token counts for a model.

use std::sync::Arc;

use parley_context::{TokenCounter, TokenizerCache};
use parley_core::{Message, ModelConfig, ModelProfile, ProfileOptions};

pub fn run(text: &str, model: &str, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let profile = ModelProfile::derive(ModelConfig::for_model(model), &ProfileOptions::default())?;
    let counter = TokenCounter::new(Arc::new(TokenizerCache::new()), &profile);

    let text_tokens = counter.count_text(text)?;
    let message_tokens = counter.count_message(&Message::user(text))?;

    if json {
        let report = serde_json::json!({
            "model": model,
            "encoding": counter.selector().key(),
            "text_tokens": text_tokens,
            "message_tokens": message_tokens,
            "context_window": profile.budget.max_context_tokens(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("  Model:     {model} ({})", counter.selector().key());
        println!("  Text:      {text_tokens} tokens");
        println!("  Message:   {message_tokens} tokens (as a user message)");
        println!("  Window:    {} tokens", profile.budget.max_context_tokens());
    }
    Ok(())
}
