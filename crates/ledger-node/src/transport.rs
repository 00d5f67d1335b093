//! HTTP implementation of the peer protocol, speaking to other nodes' APIs.

use anyhow::{Context, Result};
use ledger_core::{Block, ChainResponse, Peer, PeerTransport, PeersResponse};
use reqwest::Client;
use tracing::debug;

use crate::constants::{CHAIN_PATH, HEALTH_PATH, PEERS_PATH, RECEIVE_BLOCK_PATH};

#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl PeerTransport for HttpTransport {
    async fn fetch_chain(&self, peer: &Peer) -> Result<ChainResponse> {
        let url = format!("{}{CHAIN_PATH}", peer.url);
        debug!(%url, "fetching chain");
        let response = self.client.get(&url).send().await?.error_for_status()?;
        response
            .json()
            .await
            .with_context(|| format!("decoding chain from {url}"))
    }

    async fn fetch_peers(&self, peer: &Peer) -> Result<PeersResponse> {
        let url = format!("{}{PEERS_PATH}", peer.url);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        response
            .json()
            .await
            .with_context(|| format!("decoding peer list from {url}"))
    }

    async fn check_health(&self, peer: &Peer) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}{HEALTH_PATH}", peer.url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn send_block(&self, peer: &Peer, block: &Block) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}{RECEIVE_BLOCK_PATH}", peer.url))
            .json(block)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
