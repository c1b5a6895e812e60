//! Parley CLI entry point.
//!
//! Commands:
//! - `chat`        : Interactive chat or single-message mode
//! - `count`       : Count tokens for a model
//! - `config`      : Show or initialize the configuration
//! - `completions` : Print shell completions

use clap::{CommandFactory, Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley: streaming LLM chat with token-budgeted context",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the configured model
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Override the configured model
        #[arg(long, env = "PARLEY_MODEL")]
        model: Option<String>,

        /// Wait for the whole reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },

    /// Count the tokens a text occupies
    Count {
        text: String,

        /// Model whose encoding to use
        #[arg(long, default_value = "gpt-3.5-turbo")]
        model: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,

        /// Print the default config TOML instead
        #[arg(long = "default", conflicts_with = "init")]
        print_default: bool,
    },

    /// Print shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so streamed replies stay clean on stdout
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Chat {
            message,
            model,
            no_stream,
        } => commands::chat::run(message, model, !no_stream).await?,
        Commands::Count { text, model, json } => commands::count::run(&text, &model, json)?,
        Commands::Config {
            init,
            print_default,
        } => commands::config_cmd::run(init, print_default)?,
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "parley", &mut std::io::stdout());
        }
    }

    Ok(())
}
