use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use hashmesh::{
    ChunkSource, GossipMessage, LocalFile, LocalSearch, MSG_TYPE_HEALTH, MSG_TYPE_INVALIDATION, MeshConfig,
    MeshNode, PeerAddr, PeerId,
};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    peer_id: Option<PeerId>,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = match s.rsplit_once('/') {
            Some((addr, id)) => (addr, Some(id)),
            None => (s, None),
        };

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let peer_id = id_part
            .map(|id| PeerId::from_hex(id).context("peer id must be 64 hex characters"))
            .transpose()?;

        Ok(BootstrapPeer { addr, peer_id })
    }
}

impl From<&BootstrapPeer> for PeerAddr {
    fn from(peer: &BootstrapPeer) -> Self {
        PeerAddr::new(peer.addr.to_string(), peer.peer_id)
    }
}

#[derive(Parser, Debug)]
#[command(name = "hashmeshd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Overrides `bind` from the config file.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    realm: Option<String>,

    #[arg(short = 'B', long = "bootstrap", value_name = "IP:PORT[/PEERID]")]
    bootstrap: Vec<BootstrapPeer>,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

/// This daemon serves no files of its own; it relays, indexes and answers empty.
struct NoLocalContent;

#[async_trait]
impl LocalSearch for NoLocalContent {
    async fn search_local(&self, _query: &str, _results: mpsc::Sender<LocalFile>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ChunkSource for NoLocalContent {
    async fn read_chunk(&self, _key: &str, _offset: u64, _length: u64) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

fn load_config(args: &Args) -> Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::load(path)?,
        None => MeshConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(realm) = &args.realm {
        config.realm = realm.clone();
    }
    config.validate()?;
    Ok(config)
}

fn log_control_messages(mut rx: mpsc::Receiver<GossipMessage>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            info!(
                message_type = %message.message_type,
                originator = %message.originator.short(),
                hops = message.hops,
                bytes = message.payload.len(),
                "control message"
            );
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    let content = Arc::new(NoLocalContent);
    let node = MeshNode::start(config, content.clone(), content).await?;
    info!("Peer id: {}", node.peer_id().to_hex());
    info!("Dial as {}/{}", node.peer_addr().addr, node.peer_id().to_hex());

    for message_type in [MSG_TYPE_HEALTH, MSG_TYPE_INVALIDATION] {
        let (tx, rx) = mpsc::channel(64);
        node.subscribe(message_type, tx).await?;
        log_control_messages(rx);
    }

    if !args.bootstrap.is_empty() {
        let seeds: Vec<PeerAddr> = args.bootstrap.iter().map(PeerAddr::from).collect();
        match node.bootstrap(&seeds).await {
            Ok(reached) => info!(reached, "Bootstrap complete"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.diagnostics().await;
                info!(
                    dht_nodes = snapshot.dht_nodes,
                    active_connections = snapshot.active_connections,
                    nat_class = ?snapshot.nat_class,
                    hash_entries = snapshot.hash_entries,
                    sync_peers = snapshot.sync_peers,
                    "diagnostics snapshot"
                );
                match bincode::serialize(&snapshot) {
                    Ok(payload) => match node.publish_gossip(MSG_TYPE_HEALTH, payload).await {
                        Ok(sent) => debug!(sent, "health published"),
                        Err(e) => debug!(error = %e, "health publish failed"),
                    },
                    Err(e) => debug!(error = %e, "health encoding failed"),
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
