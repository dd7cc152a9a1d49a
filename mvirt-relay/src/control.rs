//! Control socket.
//!
//! A Unix stream socket that takes one command per connection and answers with
//! a text reply:
//!
//! - `dump [IF [PORT]]`: DHCPv4 relay and UDP forwarder registry
//! - `dump6 [IF]`: DHCPv6 relay registry
//! - `stats`: per-interface counters as JSON

use crate::dump::{V4Dump, V6Dump};
use crate::relay::RelayState;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Longest command line accepted
const MAX_COMMAND_LEN: u64 = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("too many arguments")]
    TooManyArguments,
}

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Dump {
        interface: Option<String>,
        port: Option<u16>,
    },
    Dump6 {
        interface: Option<String>,
    },
    Stats,
}

impl FromStr for Command {
    type Err = ControlError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let name = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        match (name, args.as_slice()) {
            ("dump", [rest @ ..]) if rest.len() <= 2 => {
                let port = match rest.get(1) {
                    Some(p) => Some(
                        p.parse::<u16>()
                            .map_err(|_| ControlError::InvalidPort(p.to_string()))?,
                    ),
                    None => None,
                };
                Ok(Command::Dump {
                    interface: rest.first().map(|s| s.to_string()),
                    port,
                })
            }
            ("dump6", [rest @ ..]) if rest.len() <= 1 => Ok(Command::Dump6 {
                interface: rest.first().map(|s| s.to_string()),
            }),
            ("stats", []) => Ok(Command::Stats),
            ("dump" | "dump6" | "stats", _) => Err(ControlError::TooManyArguments),
            _ => Err(ControlError::UnknownCommand(name.to_string())),
        }
    }
}

impl Command {
    /// Wire form sent by the CLI.
    pub fn to_line(&self) -> String {
        match self {
            Command::Dump { interface, port } => match (interface, port) {
                (Some(i), Some(p)) => format!("dump {i} {p}"),
                (Some(i), None) => format!("dump {i}"),
                _ => "dump".to_string(),
            },
            Command::Dump6 { interface: Some(i) } => format!("dump6 {i}"),
            Command::Dump6 { interface: None } => "dump6".to_string(),
            Command::Stats => "stats".to_string(),
        }
    }

    /// Render the reply for this command from the live relay state.
    pub fn execute(&self, state: &RelayState) -> String {
        match self {
            Command::Dump { interface, port } => V4Dump::new(
                state.config.snapshot(),
                &state.v4_servers,
                interface.as_deref(),
                *port,
            )
            .to_string(),
            Command::Dump6 { interface } => {
                V6Dump::new(state.config.snapshot(), &state.v6_servers, interface.as_deref())
                    .to_string()
            }
            Command::Stats => match serde_json::to_string_pretty(&state.stats.snapshot()) {
                Ok(json) => json + "\n",
                Err(e) => format!("error: {e}\n"),
            },
        }
    }
}

/// Serves control commands for a running daemon.
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "Control socket bound");
        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the task is dropped.
    pub async fn serve(self, state: Arc<RelayState>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &state).await {
                            debug!(error = %e, "Control connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept control connection"),
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(stream: UnixStream, state: &RelayState) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    BufReader::new(reader.take(MAX_COMMAND_LEN))
        .read_line(&mut line)
        .await?;

    let reply = match line.trim().parse::<Command>() {
        Ok(command) => {
            debug!(command = %line.trim(), "Control command");
            command.execute(state)
        }
        Err(e) => format!("error: {e}\n"),
    };
    writer.write_all(reply.as_bytes()).await?;
    writer.shutdown().await
}

/// Send `command` to the daemon listening on `path` and return its reply.
pub async fn request(path: &Path, command: &Command) -> io::Result<String> {
    let mut stream = UnixStream::connect(path).await?;
    stream
        .write_all(format!("{}\n", command.to_line()).as_bytes())
        .await?;
    stream.shutdown().await?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(reply)
}
