mod logging;

use anyhow::Context;
use clap::Parser;
use crier::oracle::LowestId;
use crier::transport::tcp::TcpTransport;
use crier::{queue, Config, Error, Participant, Phase, StateMachine, Transaction};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A replicated atomic-broadcast server. Peers elect a leader, replicate a
/// shared transaction log, and deliver committed transactions in order.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// This server's unique id within the ensemble.
    #[arg(long, env = "CRIER_SERVER_ID")]
    server_id: String,

    /// Comma-separated peer list, as `id=host:port` pairs. May be empty
    /// for a server that will join an existing cluster.
    #[arg(long, env = "CRIER_SERVERS", value_delimiter = ',')]
    servers: Vec<String>,

    /// Address to listen on for peer connections.
    #[arg(long, env = "CRIER_LISTEN", default_value = "0.0.0.0:7171")]
    listen: String,

    /// Directory holding the transaction log, epoch files and lock file.
    #[arg(long, env = "CRIER_LOGDIR")]
    logdir: PathBuf,

    /// Heartbeat and failure-detection timeout.
    #[arg(long, env = "CRIER_TIMEOUT", value_parser = humantime::parse_duration, default_value = "5s")]
    timeout: Duration,

    /// Maximum proposals persisted per log sync.
    #[arg(long, env = "CRIER_SYNC_MAX_BATCH_SIZE", default_value = "64")]
    sync_max_batch_size: usize,

    /// Join an existing cluster through this peer id, instead of electing
    /// within a static membership.
    #[arg(long, env = "CRIER_JOIN")]
    join: Option<String>,

    #[command(flatten)]
    log: logging::LogArgs,
}

/// The stock state machine: an ops surface which logs every delivery.
/// Real applications embed the `crier` crate and bring their own.
struct Announcer;

impl StateMachine for Announcer {
    fn deliver(&mut self, txn: &Transaction) {
        tracing::info!(zxid = %txn.zxid, bytes = txn.body.len(), "delivered");
    }

    fn leading(&mut self, peers: &std::collections::BTreeSet<String>) {
        tracing::info!(followers = peers.len(), "leading the cluster");
    }

    fn following(&mut self, leader: &String) {
        tracing::info!(leader = %leader, "following");
    }

    fn cluster_change(&mut self, peers: &std::collections::BTreeSet<String>) {
        tracing::info!(peers = ?peers, "cluster membership changed");
    }

    fn state_changed(&mut self, phase: Phase) {
        tracing::debug!(?phase, "phase changed");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(&cli.log);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "crierd failed");
            let code = match err.downcast_ref::<Error>() {
                Some(Error::PersistenceCorruption(_)) | Some(Error::Io(_)) => 2,
                Some(Error::LeftCluster) => 3,
                _ => 1,
            };
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut servers = BTreeMap::new();
    for pair in &cli.servers {
        let (id, addr) = pair
            .split_once('=')
            .with_context(|| format!("server {pair:?} is not an `id=host:port` pair"))?;
        servers.insert(id.to_string(), addr.to_string());
    }

    let config = Config {
        server_id: cli.server_id.clone(),
        servers: servers.clone(),
        logdir: cli.logdir,
        timeout: cli.timeout,
        sync_max_batch_size: cli.sync_max_batch_size,
        segment_max_bytes: 64 << 20,
        queue_depth: 1_024,
    };
    config.validate().context("invalid configuration")?;
    if let Some(join) = &cli.join {
        if !servers.contains_key(join) {
            anyhow::bail!("join target {join:?} is not in --servers");
        }
    }

    let (queue_tx, queue_rx) = queue::bounded(config.queue_depth);
    let transport_cancel = CancellationToken::new();
    let transport = TcpTransport::start(
        config.server_id.clone(),
        &cli.listen,
        servers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        queue_tx.clone(),
        transport_cancel.clone(),
    )
    .await
    .with_context(|| format!("failed to listen on {}", cli.listen))?;
    tracing::info!(addr = %transport.local_addr(), "listening for peers");

    let peers: Vec<String> = servers
        .keys()
        .cloned()
        .chain(std::iter::once(config.server_id.clone()))
        .collect();
    let oracle = Arc::new(LowestId(peers));

    let (participant, handle) =
        Participant::new(config, transport, queue_tx, queue_rx, oracle, Announcer)
            .map_err(anyhow::Error::from)?;

    // Ctrl-C asks the participant to unwind cleanly.
    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received ctrl-c, shutting down");
        ctrl_c_handle.shutdown();
    });

    let result = match cli.join {
        Some(contact) => participant.join(contact).await,
        None => participant.run().await,
    };
    transport_cancel.cancel();
    result.map_err(anyhow::Error::from)
}
