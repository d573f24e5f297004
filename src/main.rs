use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use difystream::protocol::{ConversationQuery, StepStatus};
use difystream::{
    CancelHandle, ChatClient, ClientConfig, ClientError, PendingFiles, Rating, SessionState,
    StreamEvent, StreamHandler,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "difystream", about = "Talk to a Dify chat app from the terminal")]
struct Cli {
    #[arg(long, env = "DIFY_API_BASE")]
    base_url: String,

    #[arg(long, env = "DIFY_API_KEY", hide_env_values = true)]
    api_key: String,

    #[arg(long, env = "DIFY_USER", default_value = difystream::config::DEFAULT_USER)]
    user: String,

    #[arg(
        long,
        env = "DIFY_CONNECT_TIMEOUT_SECS",
        default_value_t = difystream::config::DEFAULT_CONNECT_TIMEOUT.as_secs()
    )]
    connect_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message and stream the answer
    Chat {
        query: String,
        #[arg(long)]
        conversation: Option<String>,
        /// Attach a local file (repeatable)
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Input-form value as key=value (repeatable)
        #[arg(long = "input", value_parser = parse_key_value)]
        inputs: Vec<(String, String)>,
    },
    /// Stop generation for a task
    Stop { task_id: String },
    /// List conversations
    Conversations {
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        last_id: Option<String>,
    },
    /// Rename a conversation, or let the server name it
    Rename {
        conversation_id: String,
        name: Option<String>,
    },
    /// Delete a conversation
    Delete { conversation_id: String },
    /// Show a conversation's messages
    Messages {
        conversation_id: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Rate a message
    Feedback {
        message_id: String,
        rating: RatingArg,
        #[arg(long)]
        content: Option<String>,
    },
    /// Show the app's parameters
    Parameters,
    /// Upload a file and print its id
    Upload { path: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum RatingArg {
    Like,
    Dislike,
    Clear,
}

impl From<RatingArg> for Option<Rating> {
    fn from(value: RatingArg) -> Self {
        match value {
            RatingArg::Like => Some(Rating::Like),
            RatingArg::Dislike => Some(Rating::Dislike),
            RatingArg::Clear => None,
        }
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {}", raw))
}

/// Prints the answer as it streams; workflow progress goes to the log.
struct TerminalPrinter;

impl StreamHandler for TerminalPrinter {
    fn on_chunk(&mut self, text: &str) {
        print!("{}", text);
        let _ = std::io::stdout().flush();
    }

    fn on_event(&mut self, event: &StreamEvent) {
        if let Some(step) = event.workflow_step() {
            let name = step.name.as_deref().unwrap_or(&step.id);
            match step.status {
                StepStatus::Failed => tracing::warn!(
                    step = name,
                    error = step.error.as_deref().unwrap_or(""),
                    "{} failed",
                    event.kind()
                ),
                _ => tracing::info!(step = name, status = ?step.status, "{}", event.kind()),
            }
        }
    }

    fn on_error(&mut self, error: &ClientError) {
        println!();
        eprintln!("stream interrupted: {}", error);
    }

    fn on_complete(&mut self) {
        println!();
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "difystream=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::new(cli.base_url, cli.api_key, cli.user)
        .with_connect_timeout(Duration::from_secs(cli.connect_timeout_secs));
    let client = ChatClient::new(config)?;

    match cli.command {
        Command::Chat {
            query,
            conversation,
            files,
            inputs,
        } => chat(&client, query, conversation, files, inputs).await?,
        Command::Stop { task_id } => {
            client.stop_task(&task_id).await?;
            println!("stopped {}", task_id);
        }
        Command::Conversations { limit, last_id } => {
            let mut query = ConversationQuery::default();
            query.limit = limit;
            query.last_id = last_id;
            let page = client.list_conversations(&query).await?;
            for conversation in &page.data {
                println!("{}\t{}", conversation.id, conversation.name);
            }
            if page.has_more {
                println!("(more available)");
            }
        }
        Command::Rename {
            conversation_id,
            name,
        } => {
            let conversation = match name {
                Some(name) => client.rename_conversation(&conversation_id, &name).await?,
                None => client.auto_rename_conversation(&conversation_id).await?,
            };
            println!("{}\t{}", conversation.id, conversation.name);
        }
        Command::Delete { conversation_id } => {
            client.delete_conversation(&conversation_id).await?;
            println!("deleted {}", conversation_id);
        }
        Command::Messages {
            conversation_id,
            limit,
        } => {
            let page = client.list_messages(&conversation_id, None, limit).await?;
            for message in &page.data {
                if let Some(query) = &message.query {
                    println!("You: {}", query);
                }
                if let Some(answer) = &message.answer {
                    println!("Assistant: {}", answer);
                }
            }
        }
        Command::Feedback {
            message_id,
            rating,
            content,
        } => {
            client
                .submit_feedback(&message_id, rating.into(), content.as_deref())
                .await?;
        }
        Command::Parameters => {
            let parameters = client.get_parameters().await?;
            if let Some(opening) = &parameters.opening_statement {
                println!("{}", opening);
            }
            for question in parameters.opening_suggestions() {
                println!("- {}", question);
            }
        }
        Command::Upload { path } => {
            let uploaded = client.upload_file(&path).await?;
            println!("{}", uploaded.id);
        }
    }

    Ok(())
}

async fn chat(
    client: &ChatClient,
    query: String,
    conversation: Option<String>,
    files: Vec<PathBuf>,
    inputs: Vec<(String, String)>,
) -> CliResult<()> {
    let mut pending = PendingFiles::new();
    for path in files {
        pending.add(path);
    }
    let references = client.upload_pending(&mut pending).await?;

    let mut request = client.request(query).with_files(references);
    if let Some(conversation) = conversation {
        request = request.in_conversation(conversation);
    }
    for (key, value) in inputs {
        request = request.with_input(key, value);
    }

    let cancel = CancelHandle::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = client
        .send_message_with_cancel(&request, TerminalPrinter, cancel)
        .await?;
    ctrl_c.abort();
    pending.clear();

    if outcome.state == SessionState::Cancelled {
        println!();
        if let Some(task_id) = client.stop_current().await? {
            eprintln!("stopped task {}", task_id);
        }
    }

    for question in outcome.suggested_questions() {
        println!("- {}", question);
    }
    if let Some(conversation_id) = &outcome.conversation_id {
        eprintln!("conversation: {}", conversation_id);
    }
    if let Some(err) = outcome.error {
        return Err(err.into());
    }
    Ok(())
}
