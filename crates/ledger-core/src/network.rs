//! Peer registry and the sync/broadcast/discovery protocol over an abstract
//! transport.
//!
//! The network only carries chains around; whether a fetched chain is
//! adopted is decided by [`crate::chain::Blockchain::replace_chain`]. Every
//! remote call is bounded by the request timeout and the registry lock is
//! never held across one.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::now_secs;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Active,
    /// Unreachable or timed out.
    Offline,
    /// Reachable but answered the health probe with a non-success status.
    Unhealthy,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub address: String,
    pub port: u16,
    pub url: String,
    /// Seconds since the epoch of the last successful contact; 0 if never.
    pub last_seen: u64,
    pub status: PeerStatus,
}

impl Peer {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            url: format!("http://{address}:{port}"),
            address,
            port,
            last_seen: 0,
            status: PeerStatus::Active,
        }
    }

    /// Registry key, `address:port`.
    pub fn id(&self) -> String {
        peer_id(&self.address, self.port)
    }
}

fn peer_id(address: &str, port: u16) -> String {
    format!("{address}:{port}")
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerAddress {
    pub address: String,
    pub port: u16,
}

impl From<&Peer> for PeerAddress {
    fn from(peer: &Peer) -> Self {
        Self {
            address: peer.address.clone(),
            port: peer.port,
        }
    }
}

/// Body of a peer's chain endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainResponse {
    pub success: bool,
    #[serde(default)]
    pub blockchain: Vec<Block>,
}

/// Body of a peer's peer-list endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeersResponse {
    pub success: bool,
    #[serde(default)]
    pub peers: Vec<PeerAddress>,
}

/// Remote calls against a single peer. Errors mean the peer could not be
/// reached or answered garbage.
pub trait PeerTransport: Send + Sync {
    fn fetch_chain(&self, peer: &Peer) -> impl Future<Output = anyhow::Result<ChainResponse>> + Send;

    fn fetch_peers(&self, peer: &Peer) -> impl Future<Output = anyhow::Result<PeersResponse>> + Send;

    /// `Ok(false)` for a reachable peer reporting a non-success status.
    fn check_health(&self, peer: &Peer) -> impl Future<Output = anyhow::Result<bool>> + Send;

    /// `Ok(true)` when the peer accepted the block.
    fn send_block(&self, peer: &Peer, block: &Block) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

pub struct PeerNetwork<T> {
    transport: T,
    peers: RwLock<BTreeMap<String, Peer>>,
    request_timeout: Duration,
}

impl<T: PeerTransport> PeerNetwork<T> {
    pub fn new(transport: T, request_timeout: Duration) -> Self {
        Self {
            transport,
            peers: RwLock::new(BTreeMap::new()),
            request_timeout,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Registers a peer as active; an already known peer is returned as-is.
    pub fn add_peer(&self, address: &str, port: u16) -> Peer {
        let id = peer_id(address, port);
        let mut peers = self.peers.write();
        if let Some(existing) = peers.get(&id) {
            return existing.clone();
        }
        let peer = Peer::new(address, port);
        info!(peer = %id, "peer added");
        peers.insert(id, peer.clone());
        peer
    }

    pub fn remove_peer(&self, address: &str, port: u16) -> bool {
        let removed = self.peers.write().remove(&peer_id(address, port)).is_some();
        if removed {
            info!(peer = %peer_id(address, port), "peer removed");
        }
        removed
    }

    pub fn get_peer(&self, address: &str, port: u16) -> Option<Peer> {
        self.peers.read().get(&peer_id(address, port)).cloned()
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn get_active_peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .values()
            .filter(|p| p.status == PeerStatus::Active)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Fetches the peer's full chain. `None` when the peer is unreachable,
    /// slow or reports failure; a registered peer is then marked offline.
    /// Unregistered peers are contacted without being added.
    pub async fn sync_chain(&self, address: &str, port: u16) -> Option<Vec<Block>> {
        let peer = self
            .get_peer(address, port)
            .unwrap_or_else(|| Peer::new(address, port));
        match self.bounded(self.transport.fetch_chain(&peer)).await {
            Ok(response) if response.success => {
                self.mark(&peer, PeerStatus::Active);
                info!(peer = %peer.id(), blocks = response.blockchain.len(), "fetched chain from peer");
                Some(response.blockchain)
            }
            Ok(_) => {
                warn!(peer = %peer.id(), "peer reported failure serving its chain");
                self.mark(&peer, PeerStatus::Offline);
                None
            }
            Err(e) => {
                warn!(peer = %peer.id(), error = %e, "chain sync failed");
                self.mark(&peer, PeerStatus::Offline);
                None
            }
        }
    }

    /// Sends `block` to every active peer and reports per-peer acceptance.
    /// Calls run concurrently, each bounded by the request timeout.
    pub async fn broadcast_block(&self, block: &Block) -> BTreeMap<String, bool> {
        let targets = self.get_active_peers();
        let calls = targets.iter().map(|peer| async move {
            let accepted = match self.bounded(self.transport.send_block(peer, block)).await {
                Ok(accepted) => {
                    self.mark(peer, PeerStatus::Active);
                    accepted
                }
                Err(e) => {
                    warn!(peer = %peer.id(), error = %e, "broadcast failed");
                    self.mark(peer, PeerStatus::Offline);
                    false
                }
            };
            (peer.id(), accepted)
        });
        let results: BTreeMap<String, bool> = join_all(calls).await.into_iter().collect();
        info!(
            index = block.index(),
            peers = results.len(),
            accepted = results.values().filter(|ok| **ok).count(),
            "block broadcast"
        );
        results
    }

    /// Asks `seed` for its peer list and registers every entry that is not
    /// already known, skipping `own` (this node's address). Returns the
    /// newly added peers.
    pub async fn discover_peers(&self, seed: &Peer, own: Option<&PeerAddress>) -> Vec<Peer> {
        let response = match self.bounded(self.transport.fetch_peers(seed)).await {
            Ok(response) if response.success => response,
            Ok(_) => {
                warn!(peer = %seed.id(), "seed reported failure listing peers");
                return Vec::new();
            }
            Err(e) => {
                warn!(peer = %seed.id(), error = %e, "peer discovery failed");
                self.mark(seed, PeerStatus::Offline);
                return Vec::new();
            }
        };
        self.mark(seed, PeerStatus::Active);

        let mut added = Vec::new();
        for candidate in response.peers {
            if own == Some(&candidate) || self.get_peer(&candidate.address, candidate.port).is_some() {
                continue;
            }
            added.push(self.add_peer(&candidate.address, candidate.port));
        }
        info!(seed = %seed.id(), discovered = added.len(), "peer discovery finished");
        added
    }

    /// Probes every registered peer and updates its status; returns the
    /// number of healthy peers.
    pub async fn health_check(&self) -> usize {
        let targets = self.get_peers();
        let probes = targets.iter().map(|peer| async move {
            let status = match self.bounded(self.transport.check_health(peer)).await {
                Ok(true) => PeerStatus::Active,
                Ok(false) => PeerStatus::Unhealthy,
                Err(e) => {
                    debug!(peer = %peer.id(), error = %e, "health probe failed");
                    PeerStatus::Offline
                }
            };
            self.mark(peer, status);
            status
        });
        let healthy = join_all(probes)
            .await
            .into_iter()
            .filter(|s| *s == PeerStatus::Active)
            .count();
        debug!(peers = targets.len(), healthy, "health check finished");
        healthy
    }

    async fn bounded<R>(&self, call: impl Future<Output = anyhow::Result<R>>) -> anyhow::Result<R> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("no answer within {:?}", self.request_timeout)),
        }
    }

    /// Peers removed while a call was in flight stay removed.
    fn mark(&self, peer: &Peer, status: PeerStatus) {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(&peer.id()) {
            entry.status = status;
            if status == PeerStatus::Active {
                entry.last_seen = now_secs();
            }
        }
    }
}
