//! uncommitd: the uncommit proxy daemon.
//!
//! Runs the MySQL proxy in one of two modes:
//! - `passthrough`: forward every query unchanged
//! - `uncommittable`: savepoint emulation, nothing is ever committed
//!
//! # Usage
//!
//! ```text
//! uncommitd uncommittable --port 3307 --upstream-host 127.0.0.1 --upstream-user root
//! uncommitd --config uncommit.toml passthrough --group-connections
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use uncommit_policy::UncommittableProxy;
use uncommit_proxy::{MySqlProxy, MysqlConnector, Passthrough, ProxyConfig};

#[derive(Parser, Debug)]
#[command(name = "uncommitd", about = "Intercepting MySQL proxy")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Forward every query to the upstream unchanged.
    Passthrough {
        #[command(flatten)]
        overrides: Overrides,

        /// Share one upstream connection between all clients.
        #[arg(long)]
        group_connections: bool,
    },
    /// Emulate transactions with savepoints; nothing is ever committed.
    Uncommittable {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Flags that override the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Port to listen on (0 picks a free port).
    #[arg(long)]
    port: Option<u16>,

    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    upstream_host: Option<String>,

    #[arg(long)]
    upstream_port: Option<u16>,

    #[arg(long)]
    upstream_user: Option<String>,

    #[arg(long)]
    upstream_password: Option<String>,

    #[arg(long)]
    upstream_database: Option<String>,
}

impl Overrides {
    fn apply(self, mut config: ProxyConfig) -> ProxyConfig {
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(host) = self.host {
            config.listen.host = host;
        }
        if let Some(host) = self.upstream_host {
            config.upstream.host = host;
        }
        if let Some(port) = self.upstream_port {
            config.upstream.port = port;
        }
        if let Some(user) = self.upstream_user {
            config.upstream.user = user;
        }
        if let Some(password) = self.upstream_password {
            config.upstream.password = password;
        }
        if let Some(database) = self.upstream_database {
            config.upstream.database = Some(database);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,uncommitd=debug,uncommit_proxy=debug")
            }),
        )
        .init();

    let cli = Cli::parse();
    let base = match &cli.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };

    match cli.command {
        Command::Passthrough {
            overrides,
            group_connections,
        } => {
            let mut config = overrides.apply(base);
            config.proxy.group_connections |= group_connections;
            run_passthrough(config).await
        }
        Command::Uncommittable { overrides } => run_uncommittable(overrides.apply(base)).await,
    }
}

async fn run_passthrough(config: ProxyConfig) -> anyhow::Result<()> {
    info!(upstream = %config.upstream.host, "starting passthrough proxy");
    let proxy = MySqlProxy::new(config, Passthrough, Arc::new(MysqlConnector))?;
    let addr = proxy.listen().await?;
    info!(%addr, "accepting clients");

    wait_for_shutdown().await?;
    proxy.close().await;
    info!("uncommitd stopped");
    Ok(())
}

async fn run_uncommittable(config: ProxyConfig) -> anyhow::Result<()> {
    info!(upstream = %config.upstream.host, "starting uncommittable proxy");
    let proxy = UncommittableProxy::new(config)?;
    let addr = proxy.listen().await?;
    info!(%addr, "accepting clients");

    wait_for_shutdown().await?;
    proxy.close().await;
    info!("uncommitd stopped");
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}
