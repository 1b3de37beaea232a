//! Command-line interface for agentcast.

use crate::config::{DEFAULT_BIND, DEFAULT_URL};
use crate::protocol::LogLevel;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Parse a `KEY=VALUE` pair.
///
/// The key must be non-empty; the value may be empty and may contain `=`.
pub fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if key.trim().is_empty() {
        return Err(format!("empty variable name in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_level(s: &str) -> Result<LogLevel, String> {
    s.parse()
}

/// Agent output streaming server and client.
#[derive(Debug, Parser)]
#[command(name = "agentcast", version, about)]
pub struct Cli {
    /// Server URL for client commands.
    #[arg(long, env = "AGENTCAST_URL", default_value = DEFAULT_URL)]
    pub url: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "AGENTCAST_BIND", default_value = DEFAULT_BIND)]
        bind: SocketAddr,

        /// Agent catalogue (defaults to the user config dir).
        #[arg(long, env = "AGENTCAST_CONFIG")]
        config: Option<PathBuf>,

        /// Messages kept per agent.
        #[arg(long, default_value = "1000")]
        buffer_size: usize,

        /// Messages replayed to a new stream client.
        #[arg(long, default_value = "100")]
        history: usize,

        /// Seconds between keep-alive comments.
        #[arg(long, default_value = "30", value_name = "SECS")]
        keep_alive: u64,
    },

    /// List agents.
    List {
        /// Output in JSON format (for piping to jq).
        #[arg(long)]
        json: bool,
    },

    /// Start an agent.
    Start {
        /// Agent ID.
        id: String,

        /// Working directory for the agent process.
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Environment variables (KEY=VALUE format, can be repeated).
        #[arg(long, short, value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },

    /// Stop an agent.
    Stop {
        /// Agent ID.
        id: String,

        /// Send SIGKILL instead of SIGTERM.
        #[arg(long)]
        force: bool,
    },

    /// Send an input line to a running agent.
    Send {
        /// Agent ID.
        id: String,

        /// Command words, joined with spaces.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Follow agent output (reconnects automatically).
    Tail {
        /// Agent ID.
        id: String,

        /// Show raw output including ANSI escape codes.
        #[arg(long)]
        raw: bool,

        /// Only show these levels (can be repeated).
        #[arg(long = "level", short, value_parser = parse_level)]
        levels: Vec<LogLevel>,

        /// Only show lines containing this text (case-insensitive).
        #[arg(long)]
        grep: Option<String>,

        /// Lines retained for export.
        #[arg(long, default_value = "1000")]
        max_lines: usize,

        /// Write the retained lines to this file on exit (.json for JSON).
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("TOKEN=abc"),
            Ok(("TOKEN".to_string(), "abc".to_string()))
        );
        assert_eq!(
            parse_env_pair("EMPTY="),
            Ok(("EMPTY".to_string(), String::new()))
        );
        assert_eq!(
            parse_env_pair("URL=a=b"),
            Ok(("URL".to_string(), "a=b".to_string()))
        );
    }

    #[test]
    fn test_parse_env_pair_invalid() {
        assert!(parse_env_pair("NOVALUE").is_err());
        assert!(parse_env_pair("=value").is_err());
    }

    #[test]
    fn test_tail_levels() {
        let cli = Cli::try_parse_from([
            "agentcast", "tail", "a1", "--level", "warn", "-l", "error",
        ])
        .expect("parse");
        match cli.command {
            Command::Tail { id, levels, .. } => {
                assert_eq!(id, "a1");
                assert_eq!(levels, vec![LogLevel::Warn, LogLevel::Error]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_send_joins_words() {
        let cli = Cli::try_parse_from(["agentcast", "send", "a1", "ls", "-la"]).expect("parse");
        match cli.command {
            Command::Send { command, .. } => assert_eq!(command, vec!["ls", "-la"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
