#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use thread_sync::{
    ChannelState, ConnectionController, Message, MessageContent, MessageId, SyncConfig, Thread,
    ThreadId, ThreadView, ThreadsClient, WsConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "thread-sync")]
#[command(about = "Browse threads and follow one live")]
struct Cli {
    #[command(flatten)]
    endpoints: EndpointArgs,
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct EndpointArgs {
    /// Threads API base URL. Overrides THREAD_SYNC_API_BASE_URL.
    #[arg(long, global = true)]
    api_base_url: Option<String>,
    /// Live channel base URL. Derived from the API URL when unset.
    #[arg(long, global = true)]
    ws_base_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List threads.
    List,
    /// Create a thread.
    Create { title: String },
    /// Print a thread and its messages.
    Show {
        thread_id: String,
        /// Only messages with a sequence number above this one.
        #[arg(long)]
        since: Option<u64>,
    },
    /// Post a user message over HTTP.
    Send { thread_id: String, text: String },
    /// Start the agent on a thread.
    Start { thread_id: String },
    /// Stop the agent on a thread.
    Stop { thread_id: String },
    /// Follow a thread live; stdin lines are sent as user input.
    Watch {
        thread_id: String,
        /// Re-fetch the snapshot every N milliseconds in addition to live events.
        #[arg(long)]
        poll_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = resolve_config(&cli.endpoints)?;
    let client = ThreadsClient::new(config.client_config()).context("build threads client")?;

    match cli.command {
        Commands::List => {
            for thread in client.list_threads().await? {
                print_thread(&thread);
            }
        }
        Commands::Create { title } => print_thread(&client.create_thread(&title).await?),
        Commands::Show { thread_id, since } => {
            let thread_id = ThreadId::new(thread_id);
            let thread = client.get_thread(&thread_id).await?;
            print_thread(&thread);
            let messages = match since {
                Some(after) => client.get_messages_since(&thread_id, after).await?,
                None => client.get_messages(&thread_id).await?,
            };
            for message in messages {
                println!("  {}", render_message(&message));
            }
        }
        Commands::Send { thread_id, text } => {
            client.post_message(&ThreadId::new(thread_id), &text).await?;
        }
        Commands::Start { thread_id } => client.start_agent(&ThreadId::new(thread_id)).await?,
        Commands::Stop { thread_id } => client.stop_agent(&ThreadId::new(thread_id)).await?,
        Commands::Watch { thread_id, poll_ms } => {
            let mut config = config;
            if let Some(poll_ms) = poll_ms.filter(|ms| *ms > 0) {
                config.controller.poll_interval = Some(Duration::from_millis(poll_ms));
            }
            watch(config, client, ThreadId::new(thread_id)).await?;
        }
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_config(endpoints: &EndpointArgs) -> Result<SyncConfig> {
    let api_override = endpoints.api_base_url.clone();
    let ws_override = endpoints.ws_base_url.clone();
    let config = SyncConfig::from_lookup(|key| match key {
        thread_sync::config::ENV_API_BASE_URL if api_override.is_some() => api_override.clone(),
        thread_sync::config::ENV_WS_BASE_URL if ws_override.is_some() => ws_override.clone(),
        _ => std::env::var(key).ok(),
    })?;
    Ok(config)
}

async fn watch(config: SyncConfig, client: ThreadsClient, thread_id: ThreadId) -> Result<()> {
    let connector = WsConnector::new(&config.ws_base_url).context("build channel connector")?;
    let mut controller =
        ConnectionController::new(Arc::new(connector), Arc::new(client), config.controller);
    let mut views = controller.subscribe();
    controller.bind(thread_id.clone()).await;
    eprintln!("watching thread {thread_id}; type a line to send it, ctrl-c to quit");

    let mut printer = ViewPrinter::default();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                for line in printer.render(&view) {
                    match line {
                        Line::Message(text) => println!("{text}"),
                        Line::Notice(text) => eprintln!("{text}"),
                    }
                }
                if view.connection.state == ChannelState::Gone {
                    eprintln!("thread {thread_id} is gone");
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(error) = controller.send_user_input(&line).await {
                        warn!("message not sent: {}", error);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(error) => {
                    warn!("stdin closed: {}", error);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.unbind().await;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Message(String),
    Notice(String),
}

/// Turns successive views into the lines that changed since the last one.
#[derive(Default)]
struct ViewPrinter {
    printed: HashMap<MessageId, Message>,
    last_state: Option<ChannelState>,
    last_error: Option<String>,
    awaiting_input: bool,
}

impl ViewPrinter {
    fn render(&mut self, view: &ThreadView) -> Vec<Line> {
        let mut lines = Vec::new();
        if self.last_state != Some(view.connection.state) {
            self.last_state = Some(view.connection.state);
            let detail = view
                .connection
                .last_error
                .as_deref()
                .map(|error| format!(" ({error})"))
                .unwrap_or_default();
            lines.push(Line::Notice(format!(
                "-- channel {}{detail}",
                view.connection.state.as_str()
            )));
        }
        if view.last_error != self.last_error {
            self.last_error.clone_from(&view.last_error);
            if let Some(error) = view.last_error.as_deref() {
                lines.push(Line::Notice(format!("-- fetch failed: {error}")));
            }
        }

        for message in &view.messages {
            let marker = match self.printed.get(&message.id) {
                Some(previous) if previous == message => continue,
                Some(_) => '~',
                None => '+',
            };
            lines.push(Line::Message(format!("{marker} {}", render_message(message))));
            self.printed.insert(message.id.clone(), message.clone());
        }

        if view.awaiting_input && !self.awaiting_input {
            lines.push(Line::Notice("-- awaiting input".to_string()));
        }
        self.awaiting_input = view.awaiting_input;
        lines
    }
}

fn print_thread(thread: &Thread) {
    let running = if thread.running { " [running]" } else { "" };
    let created = thread
        .created_at
        .map(|created| created.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    println!("{}\t{}\t{created}{running}", thread.id, thread.title);
}

fn render_message(message: &Message) -> String {
    let sequence = message
        .sequence_number
        .map(|sequence| format!("#{sequence} "))
        .unwrap_or_default();
    let body = match (&message.content, &message.tool_name) {
        (Some(MessageContent::Text(text)), _) => text.clone(),
        (Some(MessageContent::Media(media)), _) => media
            .iter()
            .map(|item| item.url.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        (None, Some(tool)) => match &message.tool_result {
            Some(result) => format!("{tool} -> {result}"),
            None => format!("{tool}(...)"),
        },
        (None, None) => String::new(),
    };
    format!("{sequence}{}: {body}", message.role.as_str())
}
