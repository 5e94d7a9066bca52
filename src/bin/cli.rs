//! CLI speaking the cache protocol

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(name = "tinykv")]
#[command(about = "tinykv cache protocol CLI")]
#[command(version)]
struct Cli {
    /// Server cache address
    #[arg(long, default_value = "127.0.0.1:11211")]
    server: SocketAddr,

    /// Response timeout in seconds
    #[arg(long, default_value = "5")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get one or more keys (a trailing `*` scans a prefix)
    Get { keys: Vec<String> },

    /// Set a value
    Set { key: String, value: String },

    /// Set a value only if the key does not exist
    Add { key: String, value: String },

    /// Delete a key
    Delete { key: String },

    /// Increment a numeric value
    Incr { key: String, delta: u64 },

    /// Decrement a numeric value
    Decr { key: String, delta: u64 },

    /// Show server statistics
    Stats,
}

impl Commands {
    fn request(&self) -> Vec<u8> {
        match self {
            Commands::Get { keys } => format!("get {}\r\n", keys.join(" ")).into_bytes(),
            Commands::Set { key, value } => storage("set", key, value),
            Commands::Add { key, value } => storage("add", key, value),
            Commands::Delete { key } => format!("delete {}\r\n", key).into_bytes(),
            Commands::Incr { key, delta } => format!("incr {} {}\r\n", key, delta).into_bytes(),
            Commands::Decr { key, delta } => format!("decr {} {}\r\n", key, delta).into_bytes(),
            Commands::Stats => b"stats\r\n".to_vec(),
        }
    }

    /// Multi-line replies end with `END`
    fn multi_line(&self) -> bool {
        matches!(self, Commands::Get { .. } | Commands::Stats)
    }
}

fn storage(name: &str, key: &str, value: &str) -> Vec<u8> {
    let mut req = format!("{} {} 0 0 {}\r\n", name, key, value.len()).into_bytes();
    req.extend_from_slice(value.as_bytes());
    req.extend_from_slice(b"\r\n");
    req
}

fn complete(response: &[u8], multi_line: bool) -> bool {
    if multi_line {
        response.ends_with(b"END\r\n")
            || response.starts_with(b"ERROR")
            || response.starts_with(b"CLIENT_ERROR")
            || response.starts_with(b"SERVER_ERROR")
    } else {
        response.ends_with(b"\r\n")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Commands::Get { keys } = &cli.command {
        if keys.is_empty() {
            bail!("get needs at least one key");
        }
    }

    let mut stream = TcpStream::connect(cli.server)
        .await
        .with_context(|| format!("connecting to {}", cli.server))?;
    stream.write_all(&cli.command.request()).await?;

    let multi_line = cli.command.multi_line();
    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    while !complete(&response, multi_line) {
        let n = tokio::time::timeout(Duration::from_secs(cli.timeout), stream.read(&mut chunk))
            .await
            .context("timed out waiting for the server")??;
        if n == 0 {
            bail!("server closed the connection");
        }
        response.extend_from_slice(&chunk[..n]);
    }

    print!("{}", String::from_utf8_lossy(&response));
    Ok(())
}
