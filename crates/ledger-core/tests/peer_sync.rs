use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, bail};
use ledger_core::{
    Block, Blockchain, ChainConfig, ChainResponse, Peer, PeerAddress, PeerNetwork, PeerStatus,
    PeerTransport, PeersResponse, Transaction,
};
use parking_lot::Mutex;

/// In-process stand-in for remote nodes, keyed by `address:port`.
#[derive(Default)]
struct MockTransport {
    chains: HashMap<String, Vec<Block>>,
    peer_lists: HashMap<String, Vec<PeerAddress>>,
    unhealthy: HashSet<String>,
    unreachable: HashSet<String>,
    slow: HashSet<String>,
    /// Reachable, but answer `success: false`.
    failing: HashSet<String>,
    received: Mutex<Vec<(String, u64)>>,
}

impl MockTransport {
    async fn reach(&self, peer: &Peer) -> anyhow::Result<()> {
        let id = peer.id();
        if self.slow.contains(&id) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.unreachable.contains(&id) {
            bail!("connection refused: {id}");
        }
        Ok(())
    }
}

impl PeerTransport for MockTransport {
    async fn fetch_chain(&self, peer: &Peer) -> anyhow::Result<ChainResponse> {
        self.reach(peer).await?;
        let chain = self
            .chains
            .get(&peer.id())
            .ok_or_else(|| anyhow!("no chain served by {}", peer.id()))?;
        Ok(ChainResponse {
            success: !self.failing.contains(&peer.id()),
            blockchain: chain.clone(),
        })
    }

    async fn fetch_peers(&self, peer: &Peer) -> anyhow::Result<PeersResponse> {
        self.reach(peer).await?;
        Ok(PeersResponse {
            success: true,
            peers: self.peer_lists.get(&peer.id()).cloned().unwrap_or_default(),
        })
    }

    async fn check_health(&self, peer: &Peer) -> anyhow::Result<bool> {
        self.reach(peer).await?;
        Ok(!self.unhealthy.contains(&peer.id()))
    }

    async fn send_block(&self, peer: &Peer, block: &Block) -> anyhow::Result<bool> {
        self.reach(peer).await?;
        self.received.lock().push((peer.id(), block.index()));
        Ok(true)
    }
}

fn config() -> ChainConfig {
    ChainConfig::default().with_difficulty(2).without_persistence()
}

fn mined_chain(blocks: u64) -> Vec<Block> {
    let chain = Blockchain::new(config());
    for i in 0..blocks {
        chain
            .mine_block(vec![Transaction::new("A", "B", i + 1, 0)], "remote")
            .unwrap();
    }
    chain.chain()
}

fn network(transport: MockTransport) -> PeerNetwork<MockTransport> {
    PeerNetwork::new(transport, Duration::from_millis(200))
}

#[tokio::test]
async fn longer_valid_chain_replaces_and_shorter_is_rejected() -> anyhow::Result<()> {
    let ours = Blockchain::new(config());
    ours.mine_block(vec![Transaction::new("X", "Y", 1, 0)], "local")?;

    let mut transport = MockTransport::default();
    transport.chains.insert("10.0.0.1:5000".into(), mined_chain(4));
    transport.chains.insert("10.0.0.2:5000".into(), mined_chain(0));
    transport.unreachable.insert("10.0.0.3:5000".into());
    let net = network(transport);
    for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        net.add_peer(host, 5000);
    }

    let longer = net.sync_chain("10.0.0.1", 5000).await.expect("chain from peer 1");
    assert!(ours.replace_chain(longer.clone()));
    assert_eq!(ours.len(), 5);
    assert_eq!(ours.chain(), longer);

    let before = ours.chain();
    let shorter = net.sync_chain("10.0.0.2", 5000).await.expect("chain from peer 2");
    assert!(!ours.replace_chain(shorter));
    assert_eq!(ours.chain(), before);

    assert!(net.sync_chain("10.0.0.3", 5000).await.is_none());
    assert_eq!(net.get_peer("10.0.0.3", 5000).unwrap().status, PeerStatus::Offline);
    assert_eq!(net.get_active_peers().len(), 2);
    Ok(())
}

#[tokio::test]
async fn unsuccessful_chain_response_marks_peer_offline() -> anyhow::Result<()> {
    let mut transport = MockTransport::default();
    transport.chains.insert("10.0.0.4:5000".into(), mined_chain(2));
    transport.failing.insert("10.0.0.4:5000".into());
    let net = network(transport);
    net.add_peer("10.0.0.4", 5000);

    assert!(net.sync_chain("10.0.0.4", 5000).await.is_none());
    assert_eq!(net.get_peer("10.0.0.4", 5000).unwrap().status, PeerStatus::Offline);
    assert!(net.get_active_peers().is_empty());
    Ok(())
}

#[tokio::test]
async fn tampered_remote_chain_is_fetched_but_not_adopted() -> anyhow::Result<()> {
    let ours = Blockchain::new(config());
    let mut forged = mined_chain(3);
    if let ledger_core::TxRecord::Transfer(tx) = &mut forged[2].body.transactions[1] {
        tx.amount = 1_000_000;
    }

    let mut transport = MockTransport::default();
    transport.chains.insert("10.0.0.9:5000".into(), forged);
    let net = network(transport);
    net.add_peer("10.0.0.9", 5000);

    let fetched = net.sync_chain("10.0.0.9", 5000).await.expect("transport succeeded");
    assert_eq!(net.get_peer("10.0.0.9", 5000).unwrap().status, PeerStatus::Active);
    assert!(!ours.replace_chain(fetched));
    assert_eq!(ours.len(), 1);
    Ok(())
}

#[tokio::test]
async fn slow_peer_times_out_and_goes_offline() -> anyhow::Result<()> {
    let mut transport = MockTransport::default();
    transport.chains.insert("10.0.0.5:5000".into(), mined_chain(1));
    transport.slow.insert("10.0.0.5:5000".into());
    let net = network(transport);
    net.add_peer("10.0.0.5", 5000);

    let started = std::time::Instant::now();
    assert!(net.sync_chain("10.0.0.5", 5000).await.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(net.get_peer("10.0.0.5", 5000).unwrap().status, PeerStatus::Offline);
    Ok(())
}

#[tokio::test]
async fn unregistered_peer_is_contacted_but_not_added() {
    let mut transport = MockTransport::default();
    transport.chains.insert("10.9.9.9:1".into(), mined_chain(1));
    let net = network(transport);
    assert_eq!(net.sync_chain("10.9.9.9", 1).await.map(|c| c.len()), Some(2));
    assert!(net.sync_chain("10.9.9.8", 1).await.is_none());
    assert!(net.is_empty());
}

#[tokio::test]
async fn registry_add_is_idempotent() {
    let net = network(MockTransport::default());
    let first = net.add_peer("127.0.0.1", 5001);
    assert_eq!(first.url, "http://127.0.0.1:5001");
    let again = net.add_peer("127.0.0.1", 5001);
    assert_eq!(first, again);
    assert_eq!(net.len(), 1);
    assert!(net.remove_peer("127.0.0.1", 5001));
    assert!(!net.remove_peer("127.0.0.1", 5001));
}

#[tokio::test]
async fn broadcast_reports_per_peer_outcome() -> anyhow::Result<()> {
    let mut transport = MockTransport::default();
    transport.unreachable.insert("10.0.0.2:5000".into());
    let net = network(transport);
    net.add_peer("10.0.0.1", 5000);
    net.add_peer("10.0.0.2", 5000);

    let block = mined_chain(1).pop().expect("mined block");
    let outcome = net.broadcast_block(&block).await;
    assert_eq!(outcome.get("10.0.0.1:5000"), Some(&true));
    assert_eq!(outcome.get("10.0.0.2:5000"), Some(&false));
    assert_eq!(net.get_peer("10.0.0.2", 5000).unwrap().status, PeerStatus::Offline);
    assert_eq!(
        *net.transport().received.lock(),
        vec![("10.0.0.1:5000".to_string(), 1)]
    );

    // offline peers are skipped on the next round
    let outcome = net.broadcast_block(&block).await;
    assert_eq!(outcome.len(), 1);
    Ok(())
}

#[tokio::test]
async fn discovery_unions_unseen_peers() -> anyhow::Result<()> {
    let own = PeerAddress {
        address: "127.0.0.1".into(),
        port: 5000,
    };
    let mut transport = MockTransport::default();
    transport.peer_lists.insert(
        "10.0.0.1:5000".into(),
        vec![
            PeerAddress {
                address: "10.0.0.2".into(),
                port: 5000,
            },
            PeerAddress {
                address: "10.0.0.1".into(),
                port: 5000,
            },
            own.clone(),
        ],
    );
    let net = network(transport);
    let seed = net.add_peer("10.0.0.1", 5000);

    let added = net.discover_peers(&seed, Some(&own)).await;
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].id(), "10.0.0.2:5000");
    assert_eq!(net.len(), 2);

    // second round finds nothing new
    assert!(net.discover_peers(&seed, Some(&own)).await.is_empty());
    assert_eq!(net.len(), 2);
    Ok(())
}

#[tokio::test]
async fn health_check_updates_status() {
    let mut transport = MockTransport::default();
    transport.unhealthy.insert("10.0.0.2:5000".into());
    transport.unreachable.insert("10.0.0.3:5000".into());
    let net = network(transport);
    for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        net.add_peer(host, 5000);
    }

    assert_eq!(net.health_check().await, 1);
    let status = |host: &str| net.get_peer(host, 5000).unwrap().status;
    assert_eq!(status("10.0.0.1"), PeerStatus::Active);
    assert_eq!(status("10.0.0.2"), PeerStatus::Unhealthy);
    assert_eq!(status("10.0.0.3"), PeerStatus::Offline);
    assert!(net.get_peer("10.0.0.1", 5000).unwrap().last_seen > 0);
}

#[tokio::test]
async fn two_nodes_converge_through_sync() -> anyhow::Result<()> {
    let a = Blockchain::new(config());
    let b = Blockchain::new(config());
    for i in 0..3 {
        a.mine_block(vec![Transaction::new("A", "B", i + 1, 0)], "node-a")?;
    }
    b.mine_block(vec![Transaction::new("C", "D", 1, 0)], "node-b")?;

    let mut transport = MockTransport::default();
    transport.chains.insert("node-a:5000".into(), a.chain());
    let net = network(transport);
    net.add_peer("node-a", 5000);

    let candidate = net.sync_chain("node-a", 5000).await.expect("node-a chain");
    assert!(b.replace_chain(candidate));
    assert_eq!(b.chain(), a.chain());
    assert!(b.is_chain_valid().is_valid);
    Ok(())
}
