//! agentcast: agent output streaming server and client

use agentcast::client::{
    ChannelHandler, Client, HttpTransport, LogFilter, LogView, StreamClient, StreamConfig, StreamError,
    StreamEvent,
};
use agentcast::config::{AgentsConfig, ServerConfig};
use agentcast::protocol::{OutputKind, OutputMessage, StartRequest};
use agentcast::{Cli, Command, Server};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type CommandResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("agentcast=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentcast=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Serve {
            bind,
            config,
            buffer_size,
            history,
            keep_alive,
        } => {
            run_server(ServeOptions {
                bind,
                config,
                buffer_size,
                history,
                keep_alive,
            })
            .await
        }
        cmd => run_client(&cli.url, cmd).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

struct ServeOptions {
    bind: std::net::SocketAddr,
    config: Option<PathBuf>,
    buffer_size: usize,
    history: usize,
    keep_alive: u64,
}

async fn run_server(options: ServeOptions) -> CommandResult {
    let agents = AgentsConfig::load_or_default(options.config.as_deref())?;
    let config = ServerConfig {
        bind: options.bind,
        buffer_capacity: options.buffer_size,
        history_replay: options.history,
        keep_alive: Duration::from_secs(options.keep_alive.max(1)),
        agents,
    };

    let server = Arc::new(Server::new(config));
    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_server.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}

async fn run_client(url: &str, command: Command) -> CommandResult {
    let client = Client::new(url)?;

    match command {
        Command::Serve { .. } => return Err("serve is not a client command".into()),

        Command::List { json } => {
            let agents = client.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&agents)?);
            } else if agents.is_empty() {
                println!("No agents configured");
            } else {
                println!("{:<16} {:<9} {:<24} NAME", "ID", "STATUS", "JOB");
                for agent in agents {
                    println!(
                        "{:<16} {:<9} {:<24} {}",
                        agent.id,
                        agent.status,
                        agent.current_job_id.as_deref().unwrap_or("-"),
                        agent.name
                    );
                }
            }
        }

        Command::Start { id, cwd, env } => {
            let request = StartRequest {
                working_directory: cwd,
                environment: env.into_iter().collect(),
            };
            let response = client.start(&id, &request).await?;
            println!("{}", response.job_id);
        }

        Command::Stop { id, force } => {
            let response = client.stop(&id, force).await?;
            println!("{}", response.message);
        }

        Command::Send { id, command } => {
            client.send(&id, &command.join(" ")).await?;
        }

        Command::Tail {
            id,
            raw,
            levels,
            grep,
            max_lines,
            export,
        } => {
            let filter = LogFilter::new(levels, grep.as_deref());
            run_tail(&client, &id, &filter, raw, max_lines, export.as_deref()).await?;
        }
    }

    Ok(())
}

fn print_line(message: &OutputMessage, raw: bool) {
    let line = if raw {
        message.data.clone()
    } else {
        strip_ansi_escapes::strip_str(&message.data)
    };
    match message.kind {
        OutputKind::Stderr | OutputKind::Error => eprintln!("{line}"),
        OutputKind::Stdout | OutputKind::System => println!("{line}"),
    }
}

async fn run_tail(
    client: &Client,
    id: &str,
    filter: &LogFilter,
    raw: bool,
    max_lines: usize,
    export: Option<&Path>,
) -> CommandResult {
    let url = client.stream_url(id)?;
    let (handler, mut events) = ChannelHandler::new();
    let stream = StreamClient::spawn(
        StreamConfig::new(url.as_str()),
        Arc::new(HttpTransport::new()),
        handler,
    );
    stream.connect();

    let mut log = LogView::new(max_lines);
    let outcome: Result<(), StreamError> = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            event = events.recv() => match event {
                Some(StreamEvent::Message(message)) => {
                    if filter.matches(&message) {
                        print_line(&message, raw);
                    }
                    log.push(message);
                }
                Some(StreamEvent::Error(e @ StreamError::ReconnectExhausted { .. })) => break Err(e),
                Some(StreamEvent::Error(e)) => warn!(%e, "Stream error"),
                Some(StreamEvent::Connected) => info!(%id, "Connected"),
                Some(StreamEvent::StateChanged(state)) => debug!(?state, "State changed"),
                Some(StreamEvent::Disconnected) => {}
                None => break Ok(()),
            }
        }
    };
    stream.disconnect();

    if let Some(path) = export {
        write_export(&log, path)?;
        info!(path = %path.display(), lines = log.len(), "Exported log");
    }
    outcome.map_err(Into::into)
}

fn write_export(log: &LogView, path: &Path) -> CommandResult {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let contents = if is_json {
        log.export_json()?
    } else {
        log.export_text()
    };
    std::fs::write(path, contents)?;
    Ok(())
}
