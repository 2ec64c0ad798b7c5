//! Command-line interface: `bluebox serve` and `bluebox chat`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{ConfigLoader, Settings, api_key};
use crate::consumer::{ChatEvent, ChatSession, ConsumerError, ProxyClient, SendOutcome};
use crate::llm::OpenAiClient;
use crate::proxy::StreamProxy;
use crate::store::{ChatId, MemoryChatStore, User};
use crate::Server;

#[derive(Parser, Debug)]
#[command(name = "bluebox")]
#[command(author, version, about = "Streaming chat proxy and terminal chat client")]
#[command(long_about = r#"
bluebox relays chat completions from an OpenAI-compatible API as a live text
stream, and ships a terminal client that talks to it.

Configuration is merged from (later wins):
  built-in defaults, ./bluebox.toml, --config <path>, BLUEBOX_* environment

Example:
  OPENAI_API_KEY=sk-... bluebox serve --bind 127.0.0.1:3000
  bluebox chat --endpoint http://127.0.0.1:3000/api/chat
"#)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a TOML config file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the streaming chat proxy
    Serve {
        /// Address to listen on, overrides `server.bind`
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Chat with a running proxy from the terminal
    Chat {
        /// Chat endpoint URL, overrides `client.endpoint`
        #[arg(long, value_name = "URL")]
        endpoint: Option<String>,
    },
}

impl Cli {
    /// The `tracing` filter directive for the `-v` count.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub async fn run(self) -> Result<()> {
        let settings = ConfigLoader::load(self.config.as_deref()).context("loading configuration")?;
        match self.command {
            Command::Serve { bind } => serve(settings, bind).await,
            Command::Chat { endpoint } => chat(settings, endpoint).await,
        }
    }
}

async fn serve(settings: Settings, bind: Option<String>) -> Result<()> {
    let key = api_key()?;
    let backend = OpenAiClient::new(&settings.upstream.base_url, key)?;
    info!(
        base_url = backend.base_url(),
        model = %settings.upstream.model,
        temperature = settings.upstream.temperature,
        "upstream configured"
    );

    let router = Arc::new(StreamProxy::new(Arc::new(backend), settings.proxy_settings()).router());

    let addr = bind.unwrap_or(settings.server.bind);
    let server = Server::bind(&addr).await?;
    println!("Listening on http://{}", server.local_addr());

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    server
        .run_until(
            move |req| {
                let router = Arc::clone(&router);
                async move { router.route(req).await }
            },
            shutdown,
        )
        .await?;

    println!("Bye!");
    Ok(())
}

async fn chat(settings: Settings, endpoint: Option<String>) -> Result<()> {
    let endpoint = endpoint.unwrap_or(settings.client.endpoint);
    let client = ProxyClient::new(&endpoint)?;

    let user = User::new(std::env::var("USER").unwrap_or_else(|_| "local".to_owned()));
    let (session, events) = ChatSession::new(client);
    let session = Arc::new(session.with_store(Arc::new(MemoryChatStore::new()), user));

    let printer = tokio::spawn(print_events(events));

    print_welcome(&endpoint);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt().await;
        let Some(line) = lines.next_line().await? else {
            println!("Bye!");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('/') {
            if handle_command(&session, line).await {
                break;
            }
            continue;
        }

        let sending = {
            let session = Arc::clone(&session);
            let line = line.to_owned();
            tokio::spawn(async move { session.send(&line).await })
        };
        let outcome = tokio::select! {
            joined = sending => joined?,
            _ = tokio::signal::ctrl_c() => {
                session.cancel();
                Ok(SendOutcome::Cancelled)
            }
        };

        match outcome {
            Ok(SendOutcome::Truncated(_)) => eprintln!("\n[reply was cut off]"),
            Ok(SendOutcome::Cancelled) => eprintln!("\n[cancelled]"),
            Ok(_) => {}
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    drop(session);
    printer.await.ok();
    Ok(())
}

async fn prompt() {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b">>> ").await.ok();
    stdout.flush().await.ok();
}

fn print_welcome(endpoint: &str) {
    println!();
    println!("bluebox chat -> {endpoint}");
    println!();
    print_help();
}

fn print_help() {
    println!("Commands:");
    println!("  /new          - Start a new chat");
    println!("  /chats        - List your chats");
    println!("  /load <id>    - Open a chat from the list");
    println!("  /delete       - Delete the current chat");
    println!("  /help         - Show this help");
    println!("  /quit         - Exit");
    println!("Ctrl-C stops a reply while it is streaming.");
    println!();
}

/// Handles a slash command. Returns true if the REPL should exit.
async fn handle_command(session: &ChatSession, line: &str) -> bool {
    let (cmd, arg) = match line.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };

    let result: Result<(), ConsumerError> = match cmd {
        "/quit" | "/exit" | "/q" => {
            println!("Bye!");
            return true;
        }
        "/help" | "/h" | "/?" => {
            print_help();
            Ok(())
        }
        "/new" => session.new_chat().await.map(|_| println!("Started a new chat.")),
        "/chats" => session.user_chats().await.map(|chats| {
            if chats.is_empty() {
                println!("No chats yet.");
            }
            for chat in chats {
                println!("  {}  {}  ({} messages)", chat.id, chat.title, chat.message_count);
            }
        }),
        "/load" => match arg.parse::<ChatId>() {
            Ok(id) => session.load_chat(id).await,
            Err(_) => {
                println!("Usage: /load <chat id>");
                Ok(())
            }
        },
        "/delete" => session.delete_current_chat().await.map(|deleted| {
            if deleted {
                println!("Chat deleted.");
            } else {
                println!("Nothing to delete.");
            }
        }),
        _ => {
            println!("Unknown command: {cmd}");
            println!("Type /help for available commands");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
    }
    false
}

/// Renders session events: live reply text as it grows, then a newline once
/// the reply is committed.
async fn print_events(mut events: mpsc::UnboundedReceiver<ChatEvent>) {
    let mut stdout = tokio::io::stdout();
    let mut shown = 0usize;

    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Typing(true) => shown = 0,
            ChatEvent::Partial(text) => {
                // `text` is the whole reply so far; print only what is new.
                if let Some(fresh) = text.get(shown..) {
                    stdout.write_all(fresh.as_bytes()).await.ok();
                    stdout.flush().await.ok();
                }
                shown = text.len();
            }
            ChatEvent::AssistantMessage(_) => {
                stdout.write_all(b"\n\n").await.ok();
                stdout.flush().await.ok();
            }
            ChatEvent::TranscriptReplaced(messages) => {
                for message in messages {
                    println!("[{}] {}", message.role, message.content);
                }
            }
            ChatEvent::SendFailed(_)
            | ChatEvent::UserMessage(_)
            | ChatEvent::Typing(false)
            | ChatEvent::ChatListChanged
            | ChatEvent::MessageCount(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_takes_bind_and_global_flags() {
        let cli = Cli::try_parse_from(["bluebox", "serve", "-vv", "--bind", "0.0.0.0:8080"]).unwrap();
        assert_eq!(cli.log_level(), "debug");
        assert!(matches!(cli.command, Command::Serve { bind: Some(ref addr) } if addr == "0.0.0.0:8080"));
    }

    #[test]
    fn chat_takes_endpoint_and_config() {
        let cli = Cli::try_parse_from(["bluebox", "--config", "dev.toml", "chat", "--endpoint", "http://h/api/chat"])
            .unwrap();
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("dev.toml")));
        assert_eq!(cli.log_level(), "warn");
        assert!(matches!(cli.command, Command::Chat { endpoint: Some(_) }));
    }

    #[test]
    fn a_subcommand_is_required() {
        assert!(Cli::try_parse_from(["bluebox"]).is_err());
    }
}
