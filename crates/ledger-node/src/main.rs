use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use ledger_core::constants::{
    DEFAULT_BLOCK_REWARD, DEFAULT_DIFFICULTY, DEFAULT_MAX_SUPPLY, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use ledger_core::{validate_difficulty, Blockchain, ChainConfig, KeyManager, PeerAddress, PeerNetwork};
use ledger_node::api::{self, AppState};
use ledger_node::constants::{DEFAULT_DATA_DIR, DEFAULT_HEALTH_INTERVAL_SECS, DEFAULT_LISTEN};
use ledger_node::transport::HttpTransport;
use ledger_node::{initial_sync, run_health_checks};
use ledger_storage::SledStore;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(version, about = "Proof-of-work ledger node")]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:5000
    #[arg(long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Data directory for sled
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: String,

    /// Leading zero hex digits required of a block hash
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY as i64, allow_negative_numbers = true)]
    difficulty: i64,

    #[arg(long, default_value_t = DEFAULT_BLOCK_REWARD)]
    block_reward: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_SUPPLY)]
    max_supply: u64,

    /// Keep the chain in memory only
    #[arg(long)]
    no_persistence: bool,

    /// Spread the nonce search over all cores
    #[arg(long)]
    parallel_mining: bool,

    /// Seed peer as host:port; repeatable
    #[arg(long = "peer", value_name = "HOST:PORT")]
    peers: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout_secs: u64,

    /// 0 disables the periodic peer health check
    #[arg(long, default_value_t = DEFAULT_HEALTH_INTERVAL_SECS)]
    health_interval_secs: u64,
}

fn parse_peer(spec: &str) -> anyhow::Result<(String, u16)> {
    let Some((host, port)) = spec.rsplit_once(':') else {
        bail!("peer {spec:?} is not host:port");
    };
    if host.is_empty() {
        bail!("peer {spec:?} has an empty host");
    }
    let port = port
        .parse()
        .with_context(|| format!("peer {spec:?} has an invalid port"))?;
    Ok((host.to_string(), port))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ChainConfig {
        mining_difficulty: validate_difficulty(args.difficulty)?,
        block_reward: args.block_reward,
        max_supply: args.max_supply,
        enable_persistence: !args.no_persistence,
        parallel_mining: args.parallel_mining,
        ..ChainConfig::default()
    };

    let chain = if config.enable_persistence {
        let store = Arc::new(SledStore::open(&args.data_dir)?);
        Blockchain::with_store(config, store)
    } else {
        Blockchain::new(config)
    };
    let chain = Arc::new(chain);

    let request_timeout = Duration::from_secs(args.request_timeout_secs);
    let client = reqwest::Client::builder().timeout(request_timeout).build()?;
    let network = Arc::new(PeerNetwork::new(HttpTransport::new(client), request_timeout));
    for spec in &args.peers {
        let (host, port) = parse_peer(spec)?;
        network.add_peer(&host, port);
    }

    let addr: SocketAddr = args.listen.parse()?;
    let state = AppState {
        chain: Arc::clone(&chain),
        network: Arc::clone(&network),
        keys: Arc::new(KeyManager::new()),
        own: Some(PeerAddress {
            address: addr.ip().to_string(),
            port: addr.port(),
        }),
    };

    initial_sync(&state).await;
    if args.health_interval_secs > 0 {
        tokio::spawn(run_health_checks(
            Arc::clone(&network),
            Duration::from_secs(args.health_interval_secs),
        ));
    }

    let app = api::router(state);
    info!("ledger-node listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    chain.close()?;
    info!("ledger-node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_specs() {
        assert_eq!(parse_peer("10.0.0.1:5000").unwrap(), ("10.0.0.1".to_string(), 5000));
        assert_eq!(parse_peer("node-a:80").unwrap(), ("node-a".to_string(), 80));
        assert!(parse_peer("10.0.0.1").is_err());
        assert!(parse_peer(":5000").is_err());
        assert!(parse_peer("host:99999").is_err());
    }

    #[test]
    fn args_parse() {
        let args = Args::parse_from([
            "ledger-node",
            "--difficulty",
            "2",
            "--peer",
            "a:1",
            "--peer",
            "b:2",
            "--no-persistence",
        ]);
        assert_eq!(args.difficulty, 2);
        assert_eq!(args.peers, vec!["a:1", "b:2"]);
        assert!(args.no_persistence);
        assert_eq!(args.request_timeout_secs, 5);
    }
}
