use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tinykv::common::NodeRole;
use tinykv::{Config, DataServer};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "tinykv-server")]
#[command(about = "tinykv data server - cache protocol with binlog replication")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache protocol address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Storage location (data lives in <DATA>/data)
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// master or slave
    #[arg(long)]
    role: Option<NodeRole>,

    /// Address the master accepts slaves on
    #[arg(long)]
    replication_bind: Option<SocketAddr>,

    /// Master replication address (slave only)
    #[arg(long)]
    master: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.service.bind_addr = bind;
        }
        if let Some(data) = self.data {
            config.storage.location = data;
        }
        if let Some(role) = self.role {
            config.replication.role = role;
        }
        if let Some(addr) = self.replication_bind {
            config.replication.bind_addr = addr;
        }
        if let Some(master) = self.master {
            config.replication.master_addr = Some(master);
            if self.role.is_none() {
                config.replication.role = NodeRole::Slave;
            }
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())
        .with_context(|| format!("loading configuration {:?}", args.config))?;
    args.apply(&mut config);

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = DataServer::open(config)?;
    server.serve().await?;

    Ok(())
}
