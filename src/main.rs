mod ai_sdk;
mod assistant;
mod client;
mod config;
mod conversation;
mod driver;
mod error;
mod handler;
mod protocol;
mod render;
mod server;
mod stream;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use client::{ClientConfig, ClientSession};
use protocol::{Fragment, Framing};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "relay", about = "Streams assistant runs over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP relay.
    Serve(config::Config),
    /// Chat with a running relay from the terminal.
    Chat(ChatArgs),
}

#[derive(clap::Args)]
struct ChatArgs {
    #[arg(long, env = "RELAY_URL", default_value = "http://127.0.0.1:8000")]
    url: String,
    /// Continue an existing thread instead of creating one.
    #[arg(long)]
    thread: Option<String>,
    /// Upload this file into the new thread.
    #[arg(long, conflicts_with = "thread")]
    file: Option<PathBuf>,
    /// Framing the relay was started with.
    #[arg(long, env = "RELAY_FRAMING", value_enum, default_value_t = Framing::Sse)]
    framing: Framing,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Serve(config) => server::run(config).await,
        Command::Chat(args) => chat(args).await,
    }
}

/// Log filter used when `RUST_LOG` is unset. Targets are rooted at the crate
/// name of the `relay` binary, not the package name.
fn default_log_filter() -> String {
    format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME"))
}

async fn chat(args: ChatArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = ClientConfig {
        base_url: args.url,
        framing: args.framing,
    };
    let session = match args.thread {
        Some(thread_id) => ClientSession::attach(config, thread_id),
        None => ClientSession::connect(config, args.file.as_deref()).await?,
    };
    eprintln!("thread {}", session.thread_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim().to_string();
        if message.is_empty() {
            continue;
        }

        session
            .run(message, |fragment| match fragment {
                Fragment::Content { content } => {
                    print!("{}", content);
                    let _ = std::io::stdout().flush();
                }
                Fragment::Fault { error } => eprintln!("\nerror: {}", error),
            })
            .await?;
        println!();
    }

    Ok(())
}
