pub mod api;
pub mod constants;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::api::Network;

/// Probes every registered peer each `interval` until the task is dropped.
pub async fn run_health_checks(network: Arc<Network>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if network.is_empty() {
            continue;
        }
        let healthy = network.health_check().await;
        debug!(healthy, peers = network.len(), "periodic health check");
    }
}

/// Pulls the chain of every registered peer once and offers each to the
/// longest-valid-chain rule.
pub async fn initial_sync(state: &api::AppState) {
    for peer in state.network.get_peers() {
        let Some(candidate) = state.network.sync_chain(&peer.address, peer.port).await else {
            continue;
        };
        let chain = Arc::clone(&state.chain);
        match tokio::task::spawn_blocking(move || chain.replace_chain(candidate)).await {
            Ok(true) => info!(peer = %peer.id(), blocks = state.chain.len(), "adopted chain from seed peer"),
            Ok(false) => debug!(peer = %peer.id(), "seed chain not adopted"),
            Err(e) => debug!(peer = %peer.id(), error = %e, "chain replacement task failed"),
        }
    }
}
