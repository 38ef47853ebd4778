//! Command-line interface for running a node and talking to one.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::NodeConfig;
use crate::logging;
use crate::protocol::ErrorCode;
use crate::server::Server;
use crate::transport::KvClient;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a storage node until Ctrl-C or a SHUTDOWN request
    Serve {
        /// Listening address, overrides the configuration file
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Store a value
    Put {
        server: SocketAddr,
        key: String,
        value: String,
    },
    /// Fetch a value
    Get { server: SocketAddr, key: String },
    /// Delete a value
    Remove { server: SocketAddr, key: String },
    /// Check whether a node answers
    IsAlive { server: SocketAddr },
    /// Number of nodes a member sees on its ring
    Membership { server: SocketAddr },
}

impl Cli {
    pub fn load_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        Ok(config)
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = cli.load_config()?;
    logging::init(&config.logging)?;

    let client_bind: SocketAddr = "0.0.0.0:0".parse()?;
    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            let handle = Server::bind(config).await?.start();
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("listening for Ctrl-C")?;
                    info!("Ctrl-C received");
                }
                _ = handle.stopped() => {}
            }
            handle.shutdown().await;
        }
        Commands::Put { server, key, value } => {
            let client = KvClient::bind(client_bind, &config.client).await?;
            let code = client.put(server, key, value, 0).await?;
            expect_success(code)?;
            println!("{}", code);
        }
        Commands::Get { server, key } => {
            let client = KvClient::bind(client_bind, &config.client).await?;
            let response = client.get(server, key).await?;
            expect_success(response.code)?;
            if let Some((value, _)) = response.value {
                println!("{}", String::from_utf8_lossy(&value));
            }
        }
        Commands::Remove { server, key } => {
            let client = KvClient::bind(client_bind, &config.client).await?;
            let code = client.remove(server, key).await?;
            expect_success(code)?;
            println!("{}", code);
        }
        Commands::IsAlive { server } => {
            let client = KvClient::bind(client_bind, &config.client).await?;
            println!("{}", client.is_alive(server).await?);
        }
        Commands::Membership { server } => {
            let client = KvClient::bind(client_bind, &config.client).await?;
            println!("{}", client.membership_count(server).await?);
        }
    }
    Ok(())
}

fn expect_success(code: ErrorCode) -> anyhow::Result<()> {
    if code != ErrorCode::Success {
        bail!("server answered {}", code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_put() {
        let cli = Cli::try_parse_from(["shardkv", "--log-level", "debug", "put", "127.0.0.1:5000", "k", "v"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Put { .. }));
        assert_eq!(cli.load_config().unwrap().logging.level, "debug");
    }
}
