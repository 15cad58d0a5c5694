use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing_subscriber::EnvFilter;

use tether::error::Error;
use tether::events::SessionEvent;
use tether::poller::QuestionPoller;
use tether::session::{EventFeed, SessionClient, SessionDriver, SessionRegistry, handle_event};
use tether::settings::SettingsProvider;
use tether::transport::{Payload, Transport};
use tether::ui::EventPrinter;

#[derive(Parser)]
#[command(name = "tether", about = "Drive a remote agent execution server")]
struct Cli {
    /// Server base URL, including the API prefix.
    #[arg(long, env = "TETHER_BASE_URL", default_value = "http://127.0.0.1:8844/api/v1")]
    base_url: String,

    /// Model to execute with; falls back to the server's active provider.
    #[arg(long, env = "TETHER_MODEL")]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one message, stream the reply, exit when the run completes.
    Chat { message: String },
    /// Interactive conversation (/retry, /cancel, /delete, /quit).
    Repl,
    /// Check the server health endpoint.
    Health,
}

type MainResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> MainResult {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let transport = Arc::new(Transport::new(&cli.base_url));
    let settings = SettingsProvider::new(Arc::clone(&transport));
    let client = Arc::new(SessionClient::new(Arc::clone(&transport)));
    let registry = Arc::new(SessionRegistry::new());
    let driver = SessionDriver::new(Arc::clone(&client), Arc::clone(&registry));

    let mut input = BufReader::new(tokio::io::stdin());
    match cli.command {
        Command::Chat { message } => {
            let model = settings.resolve_model(cli.model.as_deref()).await?;
            let feed = driver.send(&message, &model).await?;
            drive_to_completion(&driver, feed, &mut input).await?;
        }
        Command::Repl => {
            repl(&driver, &settings, cli.model.as_deref(), &mut input).await?;
        }
        Command::Health => match transport.get("health").await? {
            Payload::Text(text) => println!("{}", text.trim()),
            other => println!("{other:?}"),
        },
    }

    Ok(())
}

/// Consumes run feeds until the session settles, answering questions from
/// stdin along the way. Each answer resumes execution on a fresh feed.
async fn drive_to_completion<R: AsyncBufRead + Unpin>(
    driver: &Arc<SessionDriver>,
    mut feed: EventFeed,
    input: &mut R,
) -> MainResult {
    let mut printer = EventPrinter::new();
    loop {
        let mut question_pending = false;
        while let Some(item) = feed.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "display feed lagged behind the stream");
                    continue;
                }
            };
            handle_event(&event, &mut printer);
            match event {
                SessionEvent::Done | SessionEvent::Error { .. } => return Ok(()),
                SessionEvent::Question { .. } => {
                    question_pending = true;
                    break;
                }
                _ => {}
            }
        }

        if !question_pending {
            return Ok(());
        }

        let answer = prompt(input, "answer> ").await?;
        feed = driver.respond(answer.trim()).await?;
    }
}

async fn repl<R: AsyncBufRead + Unpin>(
    driver: &Arc<SessionDriver>,
    settings: &SettingsProvider,
    explicit_model: Option<&str>,
    input: &mut R,
) -> MainResult {
    println!("tether repl: /retry, /cancel, /delete, /quit");
    let mut poller: Option<JoinHandle<()>> = None;

    loop {
        let line = prompt(input, "> ").await?;
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/cancel" => {
                if let Err(err) = driver.cancel().await {
                    eprintln!("cancel failed: {err}");
                }
            }
            "/delete" => {
                if let Some(task) = poller.take() {
                    task.abort();
                }
                match driver.delete().await {
                    Ok(()) => println!("session deleted"),
                    Err(err) => eprintln!("delete failed: {err}"),
                }
            }
            "/retry" => match driver.regenerate().await {
                Ok(Some(feed)) => {
                    drive_to_completion(driver, feed, input).await?;
                    ensure_poller(driver, &mut poller).await;
                }
                Ok(None) => println!("nothing to retry"),
                Err(err) => eprintln!("retry failed: {err}"),
            },
            message => {
                let model = match settings.resolve_model(explicit_model).await {
                    Ok(model) => model,
                    Err(err) => {
                        eprintln!("{err}");
                        continue;
                    }
                };
                match driver.send(message, &model).await {
                    Ok(feed) => {
                        drive_to_completion(driver, feed, input).await?;
                        ensure_poller(driver, &mut poller).await;
                    }
                    Err(Error::ExecutionRejected(message)) => {
                        eprintln!("rejected: {message}");
                    }
                    Err(err) => eprintln!("{err}"),
                }
            }
        }
    }

    if let Some(task) = poller {
        task.abort();
    }
    Ok(())
}

/// The poll fallback picks up questions that arrive when no stream is
/// attached, e.g. after the feed for a run has been fully consumed.
async fn ensure_poller(driver: &Arc<SessionDriver>, poller: &mut Option<JoinHandle<()>>) {
    if poller.is_some() {
        return;
    }
    let Some(session_id) = driver.session_id().await else {
        return;
    };
    let task = QuestionPoller::new(
        Arc::clone(driver.client()),
        Arc::clone(driver.registry()),
        Arc::clone(driver.conversation()),
        session_id,
    )
    .spawn();
    *poller = Some(task);
}

/// Reads one line from the shared reader. The reader lives for the whole
/// session so bytes buffered past a newline (pasted multi-line input) are
/// consumed by the next call instead of being dropped.
async fn prompt<R: AsyncBufRead + Unpin>(input: &mut R, label: &str) -> Result<String, std::io::Error> {
    use std::io::Write;
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    input.read_line(&mut line).await?;
    Ok(line)
}
