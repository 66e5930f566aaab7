//! Shovel CLI - forward a local TCP port to a remote address
//!
//! Every accepted connection is paired with a fresh upstream connection and
//! relayed in both directions until either side hangs up. Ctrl-C stops all
//! forwarded connections and waits for them to finish.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shovel_relay::{HaltNode, RelayConfig, RelayPair, StreamEndpoint};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shovel - Relay TCP connections with coordinated shutdown
#[derive(Parser, Debug)]
#[command(name = "shovel")]
#[command(about = "Shovel - Relay TCP connections with coordinated shutdown")]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen locally and forward every connection to a target address
    #[command(long_about = r#"
Listen on a local address and forward every incoming connection to a target
address. Each connection is relayed in both directions until either side
closes; the other direction is then shut down as well.

EXAMPLES:
  # Expose a local PostgreSQL on another port
  shovel forward --listen 0.0.0.0:5433 --target 127.0.0.1:5432

  # Dump all relayed bytes to stdout
  shovel forward --listen 127.0.0.1:8080 --target 10.0.0.5:80 --log-traffic

ENVIRONMENT VARIABLES:
  SHOVEL_LISTEN       Local address to bind
  SHOVEL_TARGET       Address to forward to
  SHOVEL_LOG_TRAFFIC  Mirror relayed bytes to stdout
    "#)]
    Forward {
        /// Local address to bind (e.g., 127.0.0.1:5433)
        #[arg(long, env = "SHOVEL_LISTEN")]
        listen: SocketAddr,

        /// Address to forward connections to (e.g., 127.0.0.1:5432)
        #[arg(long, env = "SHOVEL_TARGET")]
        target: String,

        /// Mirror relayed bytes to stdout
        #[arg(long, env = "SHOVEL_LOG_TRAFFIC")]
        log_traffic: bool,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Forward {
            listen,
            target,
            log_traffic,
        } => {
            let config = RelayConfig::new().with_log_traffic(log_traffic);
            forward(listen, target, config).await
        }
    }
}

/// Accept connections until Ctrl-C, then stop every relay and wait for them.
async fn forward(listen: SocketAddr, target: String, config: RelayConfig) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(
        "Forwarding {} -> {}",
        listener.local_addr().unwrap_or(listen),
        target
    );

    let root = HaltNode::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down, stopping {} connection(s)", connections.len());
                break;
            }
            accepted = listener.accept() => {
                let (client, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let pair = RelayPair::new(config.clone());
                root.add_downstream(pair.halt().clone());

                let target = target.clone();
                connections.spawn(serve_connection(pair, client, peer_addr, target));
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {
                root.prune_done();
            }
        }
    }

    root.request_stop();
    while connections.join_next().await.is_some() {}
    root.mark_done();

    info!("All connections closed");
    Ok(())
}

/// Run one forwarded connection, then stop its pair whatever the outcome so
/// the root node can prune it.
async fn serve_connection(
    pair: RelayPair,
    client: TcpStream,
    peer_addr: SocketAddr,
    target: String,
) {
    if let Err(e) = handle_connection(&pair, client, peer_addr, &target).await {
        warn!("Connection from {} failed: {:#}", peer_addr, e);
    }
    pair.stop().await;
}

async fn handle_connection(
    pair: &RelayPair,
    client: TcpStream,
    peer_addr: SocketAddr,
    target: &str,
) -> Result<()> {
    let stop_requested = pair.halt().stop_requested_signal();
    let upstream = tokio::select! {
        _ = stop_requested.wait() => {
            debug!("Shutdown before {} reached {}", peer_addr, target);
            return Ok(());
        }
        upstream = TcpStream::connect(target) => {
            upstream.with_context(|| format!("Failed to connect to {}", target))?
        }
    };

    debug!("Connection {} -> {} established", peer_addr, target);

    pair.start(
        Arc::new(StreamEndpoint::new(client)),
        Arc::new(StreamEndpoint::new(upstream)),
        format!("{} <- {}", peer_addr, target),
        format!("{} -> {}", peer_addr, target),
    )
    .await?;

    pair.halt().done_signal().wait().await;

    debug!(
        "Connection {} closed ({} bytes in, {} bytes out)",
        peer_addr,
        pair.ba().bytes_copied(),
        pair.ab().bytes_copied()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn accepted_client() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (client, peer_addr) = listener.accept().await.unwrap();
        (client, peer_addr, remote)
    }

    #[tokio::test]
    async fn test_refused_target_is_pruned() {
        // Bind then drop to get an address nobody listens on.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = unused.local_addr().unwrap().to_string();
        drop(unused);

        let root = HaltNode::new();
        for _ in 0..3 {
            let (client, peer_addr, _remote) = accepted_client().await;
            let pair = RelayPair::new(RelayConfig::default());
            root.add_downstream(pair.halt().clone());

            tokio::time::timeout(
                Duration::from_secs(5),
                serve_connection(pair, client, peer_addr, target.clone()),
            )
            .await
            .expect("failed connection should finish");
        }

        assert_eq!(root.prune_done(), 3);
        assert_eq!(root.downstream_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_is_pruned() {
        let (client, peer_addr, _remote) = accepted_client().await;
        let root = HaltNode::new();
        root.request_stop();

        let pair = RelayPair::new(RelayConfig::default());
        root.add_downstream(pair.halt().clone());

        tokio::time::timeout(
            Duration::from_secs(5),
            serve_connection(pair, client, peer_addr, "127.0.0.1:9".to_string()),
        )
        .await
        .expect("stopped connection should finish");

        assert_eq!(root.prune_done(), 1);
    }
}
