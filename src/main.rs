//! Narrator CLI binary entry point.

use std::io::Write;

use clap::Parser;
use futures::StreamExt;
use narrator::cli::{load_transcript, Cli, Commands, UpdateArgs};
use narrator::command::CommandReply;
use narrator::config::NarratorConfig;
use narrator::gateway::{Narrator, Prepared, PreparedStream};
use narrator::stream_transform::sse_lines;
use narrator::types::ChatMessage;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("narrator=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        eprintln!("Hint: {}", e.recovery_suggestion().hint());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> narrator::error::Result<()> {
    let mut config = NarratorConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.store.data_dir = Some(dir);
    }
    if let Commands::Update(UpdateArgs {
        mode: Some(mode), ..
    }) = &cli.command
    {
        config.workflow.mode = *mode;
    }

    let narrator = Narrator::from_config(config)?;
    let session = cli.session.as_str();

    match cli.command {
        Commands::Update(args) => {
            let messages = load_transcript(&args.transcript)?;
            if args.stream {
                update_streaming(&narrator, session, &messages).await
            } else {
                update(&narrator, session, &messages).await
            }
        }
        Commands::Show => command(&narrator, session, "$show").await,
        Commands::Reset => command(&narrator, session, "$reset").await,
        Commands::Command(args) => command(&narrator, session, &args.text).await,
    }
}

async fn update(
    narrator: &Narrator,
    session: &str,
    messages: &[ChatMessage],
) -> narrator::error::Result<()> {
    match narrator.prepare(session, messages).await? {
        Prepared::Reply(reply) => print_reply(&reply),
        Prepared::Forward {
            messages,
            admission,
        } => {
            eprintln!(
                "admission: {} ({})",
                admission.outcome,
                admission
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no result".into())
            );
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
    }
    Ok(())
}

async fn update_streaming(
    narrator: &Narrator,
    session: &str,
    messages: &[ChatMessage],
) -> narrator::error::Result<()> {
    match narrator.prepare_streaming(session, messages).await? {
        PreparedStream::Reply { sse, .. } => print!("{sse}"),
        PreparedStream::Progress { frames, admission } => {
            let request_id = uuid::Uuid::new_v4().to_string();
            let created = chrono::Utc::now().timestamp();
            let mut lines = sse_lines(frames, request_id, created);
            let mut stdout = std::io::stdout();
            while let Some(line) = lines.next().await {
                stdout.write_all(line.as_bytes())?;
                stdout.flush()?;
            }
            if let Some(handle) = admission.result {
                handle.wait().await;
            }
            let injected = narrator.inject(session, messages).await?;
            println!("{}", serde_json::to_string_pretty(&injected)?);
        }
    }
    Ok(())
}

async fn command(narrator: &Narrator, session: &str, text: &str) -> narrator::error::Result<()> {
    let messages = [ChatMessage::user(text)];
    match narrator.router().route(session, &messages).await {
        Some(reply) => print_reply(&reply),
        None => println!("No directive found. Try \"$help\"."),
    }
    Ok(())
}

fn print_reply(reply: &CommandReply) {
    println!("{}", reply.text);
}
