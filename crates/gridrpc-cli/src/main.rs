//! # gridrpc CLI Entry Point
//!
//! Main binary for the gridrpc compute cluster. Starts either the master
//! (the membership-tracking coordinator) or a worker (which serves RPCs and
//! heartbeats to its masters).
//!
//! ## Usage
//!
//! ```bash
//! # Start a master
//! gridrpc master -b 0.0.0.0:7050
//!
//! # Start a worker reporting to two masters
//! gridrpc worker -m master-a:7050 -m master-b:7050 -b 0.0.0.0:0
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use argh::FromArgs;

use gridrpc_master::proto::HostPort;
use gridrpc_master::{Master, MasterOptions};
use gridrpc_worker::{HeartbeatOptions, WorkerOptions, WorkerServer};

/// Parse a `host:port` pair as used for master and advertised addresses.
fn parse_host_port(value: &str) -> Result<HostPort> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid address '{}': expected host:port", value))?;
    if host.is_empty() {
        return Err(anyhow!("invalid address '{}': empty host", value));
    }
    let port: u16 = port
        .parse()
        .map_err(|e| anyhow!("invalid port in '{}': {}", value, e))?;
    Ok(HostPort::new(host, port))
}

#[derive(FromArgs)]
/// gridrpc - distributed compute-cluster control plane
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Master(MasterArgs),
    Worker(WorkerArgs),
}

/// Arguments for starting the cluster master.
#[derive(FromArgs)]
#[argh(subcommand, name = "master")]
/// start the gridrpc master
struct MasterArgs {
    /// address to accept worker RPC connections on
    ///
    /// Can be given multiple times to bind several addresses.
    #[argh(option, short = 'b')]
    bind: Vec<String>,

    /// accept tasks per bound address
    #[argh(option, long = "acceptors-per-address", default = "1")]
    acceptors_per_address: usize,

    /// worker tasks executing master service handlers
    #[argh(option, long = "service-workers", default = "4")]
    service_workers: usize,

    /// capacity of the master service dispatch queue
    ///
    /// Calls past this limit are rejected with a retryable busy error.
    #[argh(option, long = "service-queue-length", default = "50")]
    service_queue_length: usize,

    /// seconds without a heartbeat before a worker is presumed dead
    #[argh(option, long = "worker-dead-timeout-secs", default = "60")]
    worker_dead_timeout_secs: u64,

    /// number of reactor tasks
    #[argh(option, long = "reactors", default = "4")]
    reactors: usize,
}

/// Arguments for starting a worker.
#[derive(FromArgs)]
#[argh(subcommand, name = "worker")]
/// start a gridrpc worker
struct WorkerArgs {
    /// master address (host:port) to heartbeat to
    ///
    /// Can be given multiple times; one heartbeat task runs per master.
    #[argh(option, short = 'm', long = "master")]
    masters: Vec<String>,

    /// address to accept RPC connections on
    ///
    /// Defaults to "0.0.0.0:0", which picks a free port; the bound address
    /// is logged at startup and advertised in the registration.
    #[argh(option, short = 'b', default = "\"0.0.0.0:0\".into()")]
    bind: String,

    /// advertised admin HTTP address (host:port) for the registration
    #[argh(option, long = "http-address", default = "\"0.0.0.0:8051\".into()")]
    http_address: String,

    /// interval between heartbeats, in milliseconds
    #[argh(option, long = "heartbeat-interval-ms", default = "1000")]
    heartbeat_interval_ms: u64,

    /// timeout for each heartbeat RPC, in milliseconds
    #[argh(option, long = "heartbeat-rpc-timeout-ms", default = "15000")]
    heartbeat_rpc_timeout_ms: u64,

    /// consecutive heartbeat failures before backing off to the normal
    /// interval instead of retrying registration immediately
    #[argh(option, long = "heartbeat-max-failures-before-backoff", default = "3")]
    heartbeat_max_failures_before_backoff: u32,

    /// number of reactor tasks
    #[argh(option, long = "reactors", default = "4")]
    reactors: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level INFO, overridable via RUST_LOG.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli: Cli = argh::from_env();
    match cli.command {
        Commands::Master(args) => run_master(args).await,
        Commands::Worker(args) => run_worker(args).await,
    }
}

async fn run_master(args: MasterArgs) -> Result<()> {
    let binds = if args.bind.is_empty() {
        vec!["0.0.0.0:7050".to_string()]
    } else {
        args.bind
    };
    let mut bind_addresses = Vec::with_capacity(binds.len());
    for bind in &binds {
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow!("invalid bind address {}: {}", bind, e))?;
        bind_addresses.push(addr);
    }

    let master = Master::start(MasterOptions {
        bind_addresses,
        num_acceptors_per_address: args.acceptors_per_address,
        num_service_workers: args.service_workers,
        service_queue_length: args.service_queue_length,
        worker_dead_timeout: Duration::from_secs(args.worker_dead_timeout_secs),
        num_reactors: args.reactors,
        ..MasterOptions::default()
    })
    .await?;
    tracing::info!("master started on {:?}", master.bound_addresses());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    master.shutdown().await;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    if args.masters.is_empty() {
        return Err(anyhow!("at least one --master address is required"));
    }
    let mut master_addresses = Vec::with_capacity(args.masters.len());
    for master in &args.masters {
        master_addresses.push(parse_host_port(master)?);
    }
    let bind_address: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow!("invalid bind address {}: {}", args.bind, e))?;
    let http_address = parse_host_port(&args.http_address)?;

    let worker = WorkerServer::start(WorkerOptions {
        master_addresses,
        bind_address,
        http_address,
        heartbeat: HeartbeatOptions {
            interval: Duration::from_millis(args.heartbeat_interval_ms),
            rpc_timeout: Duration::from_millis(args.heartbeat_rpc_timeout_ms),
            max_failures_before_backoff: args.heartbeat_max_failures_before_backoff,
        },
        num_reactors: args.reactors,
        ..WorkerOptions::default()
    })
    .await?;
    tracing::info!(
        "worker {} started on {}",
        worker.instance().permanent_uuid,
        worker.bound_rpc_address()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    worker.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let hp = parse_host_port("master-a:7050").unwrap();
        assert_eq!(hp, HostPort::new("master-a", 7050));
        assert!(parse_host_port("noport").is_err());
        assert!(parse_host_port(":7050").is_err());
        assert!(parse_host_port("host:notaport").is_err());
    }

    #[test]
    fn test_cli_parse_master() {
        let args: Cli = Cli::from_args(
            &["gridrpc"],
            &["master", "-b", "0.0.0.0:7050", "--service-workers", "8"],
        )
        .unwrap();
        match args.command {
            Commands::Master(MasterArgs {
                bind,
                service_workers,
                service_queue_length,
                worker_dead_timeout_secs,
                ..
            }) => {
                assert_eq!(bind, vec!["0.0.0.0:7050".to_string()]);
                assert_eq!(service_workers, 8);
                assert_eq!(service_queue_length, 50); // default
                assert_eq!(worker_dead_timeout_secs, 60); // default
            }
            _ => panic!("expected master command"),
        }
    }

    #[test]
    fn test_cli_parse_master_multiple_binds() {
        let args: Cli = Cli::from_args(
            &["gridrpc"],
            &["master", "-b", "10.0.0.1:7050", "-b", "10.0.0.2:7050"],
        )
        .unwrap();
        match args.command {
            Commands::Master(MasterArgs { bind, .. }) => {
                assert_eq!(bind.len(), 2);
            }
            _ => panic!("expected master command"),
        }
    }

    #[test]
    fn test_cli_parse_worker() {
        let args: Cli = Cli::from_args(
            &["gridrpc"],
            &[
                "worker",
                "-m",
                "master-a:7050",
                "--master",
                "master-b:7050",
                "--heartbeat-interval-ms",
                "500",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Worker(WorkerArgs {
                masters,
                bind,
                heartbeat_interval_ms,
                heartbeat_max_failures_before_backoff,
                ..
            }) => {
                assert_eq!(
                    masters,
                    vec!["master-a:7050".to_string(), "master-b:7050".to_string()]
                );
                assert_eq!(bind, "0.0.0.0:0"); // default
                assert_eq!(heartbeat_interval_ms, 500);
                assert_eq!(heartbeat_max_failures_before_backoff, 3); // default
            }
            _ => panic!("expected worker command"),
        }
    }
}
