//! `parley chat`: Interactive or single-message chat.
//!
//! Replies stream to stdout. Ctrl+C cancels the reply in flight and keeps
//! whatever arrived; a second Ctrl+C at the prompt exits.

use std::io::Write;
use std::sync::Arc;

use parley_client::{
    ChatClient, ChatClientBuilder, ChatReply, CompletionStatus, InMemoryUsageRecorder, SendOptions,
};
use parley_config::AppConfig;
use parley_context::TokenizerCache;
use parley_core::{Conversation, Message, RunState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

pub async fn run(
    message: Option<String>,
    model: Option<String>,
    stream: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(model) = model {
        config.model.model = model;
    }
    let stream = stream && config.model.streaming;

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    PARLEY_API_KEY      = 'sk-...'");
        eprintln!("    OPENAI_API_KEY      = 'sk-...'");
        eprintln!("    OPENROUTER_API_KEY  = 'sk-or-v1-...'   (routes through OpenRouter)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let cache = Arc::new(TokenizerCache::new());
    let usage = Arc::new(InMemoryUsageRecorder::new());
    let client = ChatClientBuilder::from_config(&config, cache)?
        .usage_recorder(usage.clone())
        .build()?;
    let mut conversation = Conversation::new();

    if let Some(message) = message {
        turn(&client, &mut conversation, message, stream).await?;
        client.flush_usage().await;
        print_session_usage(&usage);
        return Ok(());
    }

    println!();
    println!("  Parley interactive mode");
    println!();
    println!("  Model:     {}", client.profile().model());
    println!("  Context:   {:?}", client.profile().strategy);
    println!(
        "  Budget:    {} prompt / {} response tokens",
        client.profile().budget.max_prompt_tokens(),
        client.profile().budget.max_response_tokens()
    );
    println!();
    println!("  Type your message and press Enter.");
    println!("  Ctrl+C stops a reply; type 'exit' to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit" | "/exit" | "/quit") {
            break;
        }

        let first_turn = conversation.messages.is_empty();
        match turn(&client, &mut conversation, line.to_string(), stream).await {
            Ok(reply) if first_turn && reply.status == CompletionStatus::Completed => {
                let title = client
                    .title_conversation(line, &reply.text, CancellationToken::new())
                    .await;
                if let Some(title) = title {
                    println!("  [{title}]");
                    conversation.title = Some(title);
                }
            }
            Ok(_) => {}
            Err(e) => eprintln!("  [Error] {e}"),
        }
        println!();
    }

    println!();
    client.flush_usage().await;
    print_session_usage(&usage);
    println!("  Goodbye!");
    println!();
    Ok(())
}

fn print_session_usage(usage: &InMemoryUsageRecorder) {
    let turns = usage.records().len();
    if turns == 0 {
        return;
    }
    let (prompt, completion) = usage.totals();
    eprintln!("  Usage: {turns} turn(s), {prompt} prompt + {completion} completion tokens");
}

/// Send one user message and append the reply to the conversation.
async fn turn(
    client: &ChatClient,
    conversation: &mut Conversation,
    text: String,
    stream: bool,
) -> Result<ChatReply, Box<dyn std::error::Error>> {
    conversation.push(Message::user(text));
    let mut history = conversation.history(true);

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut run = RunState::with_cancel(cancel).for_conversation(conversation.id.clone());
    let mut stdout = std::io::stdout();
    let mut on_token = |token: &str| {
        let _ = write!(stdout, "{token}");
        let _ = stdout.flush();
    };

    print!("\n  Assistant > ");
    std::io::stdout().flush()?;
    let result = client
        .send_message(
            &mut history,
            SendOptions {
                on_token: stream.then_some(&mut on_token as &mut (dyn FnMut(&str) + Send)),
                ..Default::default()
            },
            &mut run,
        )
        .await;
    watcher.abort();
    let reply = result?;

    if !stream {
        print!("{}", reply.text);
    }
    match reply.status {
        CompletionStatus::Aborted => println!("\n  [stopped]"),
        CompletionStatus::Recovered => println!("\n  [reply interrupted by a provider error]"),
        CompletionStatus::Completed => println!(),
    }

    // Persist counts and any new summary on the stored messages
    for message in &history {
        if let Some(stored) = conversation.messages.iter_mut().find(|m| m.id == message.id) {
            if stored.token_count.is_none() && stored.summary.is_none() {
                stored.token_count = message.token_count;
            }
        }
    }
    if let Some(summary) = &reply.summary {
        let last_covered = summary.covered.end.checked_sub(1).and_then(|i| history.get(i));
        if let Some(last_covered) = last_covered {
            if let Some(stored) = conversation
                .messages
                .iter_mut()
                .find(|m| m.id == last_covered.id)
            {
                stored.summary = Some(summary.summary_text.clone());
                stored.summary_token_count = Some(summary.token_count);
            }
        }
    }

    if !reply.text.is_empty() {
        let assistant = Message::assistant(reply.text.clone()).with_token_count(reply.completion_tokens);
        conversation.push(assistant);
    }
    Ok(reply)
}
