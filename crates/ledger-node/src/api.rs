//! HTTP façade over the chain, the miner, the peer network and the key
//! manager. Every JSON body carries a `success` flag; failures add `error`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ledger_core::{
    Block, Blockchain, KeyManager, LedgerError, MerkleTree, PeerAddress, PeerNetwork, ProofStep,
    Transaction,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::constants::{CHAIN_PATH, DEFAULT_MINER_ADDRESS, HEALTH_PATH, PEERS_PATH, RECEIVE_BLOCK_PATH};
use crate::transport::HttpTransport;

pub type Network = PeerNetwork<HttpTransport>;

#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<Blockchain>,
    pub network: Arc<Network>,
    pub keys: Arc<KeyManager>,
    /// This node's advertised address, never registered as its own peer.
    pub own: Option<PeerAddress>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(CHAIN_PATH, get(get_chain))
        .route("/blocks/{index}", get(get_block))
        .route("/blocks/{index}/proof/{tx}", get(get_proof))
        .route(RECEIVE_BLOCK_PATH, post(receive_block))
        .route("/transactions", post(create_transaction))
        .route("/mempool", get(get_mempool))
        .route("/mine", post(start_mining))
        .route("/mine/status/{job_id}", get(mining_status))
        .route("/mine/cancel/{job_id}", post(cancel_mining))
        .route("/mine/jobs", get(mining_jobs))
        .route("/verify/tx-proof", post(verify_tx_proof))
        .route(PEERS_PATH, get(get_peers).post(add_peer))
        .route("/peers/sync", post(sync_from_peer))
        .route("/peers/discover", post(discover_peers))
        .route("/stats", get(get_stats))
        .route("/keys", get(list_keys).post(create_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::StaleTip { .. } | LedgerError::JobExists(_) => StatusCode::CONFLICT,
            LedgerError::JobNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Storage(_) | LedgerError::Worker(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<JoinError> for ApiError {
    fn from(err: JoinError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "status": "healthy",
        "blocks": state.chain.len(),
        "mempool_size": state.chain.pool().size(),
    }))
}

async fn get_chain(State(state): State<AppState>) -> ApiResult {
    let chain = Arc::clone(&state.chain);
    let (blocks, stats) = tokio::task::spawn_blocking(move || (chain.chain(), chain.get_stats())).await?;
    Ok(Json(json!({ "success": true, "blockchain": blocks, "stats": stats })))
}

async fn get_block(State(state): State<AppState>, Path(index): Path<u64>) -> ApiResult {
    let block = state
        .chain
        .get_block(index)
        .ok_or_else(|| ApiError::not_found(format!("Block {index} not found")))?;
    let tree = MerkleTree::new(block.transactions());
    Ok(Json(json!({ "success": true, "block": block, "merkle_tree": tree })))
}

async fn get_proof(State(state): State<AppState>, Path((index, tx)): Path<(u64, usize)>) -> ApiResult {
    let proof = state
        .chain
        .merkle_proof(index, tx)
        .ok_or_else(|| ApiError::not_found(format!("No transaction {tx} in block {index}")))?;
    Ok(Json(json!({ "success": true, "proof": proof })))
}

async fn receive_block(State(state): State<AppState>, Json(block): Json<Block>) -> ApiResult {
    let index = block.index();
    let chain = Arc::clone(&state.chain);
    tokio::task::spawn_blocking(move || chain.accept_block(block)).await??;
    Ok(Json(json!({ "success": true, "message": "Block accepted", "index": index })))
}

#[derive(Debug, Deserialize)]
struct TransactionRequest {
    #[serde(default)]
    id: Option<String>,
    sender: String,
    recipient: String,
    amount: u64,
    #[serde(default)]
    fee: u64,
    #[serde(default)]
    signature: Option<String>,
}

async fn create_transaction(State(state): State<AppState>, Json(req): Json<TransactionRequest>) -> ApiResult {
    let mut tx = Transaction::new(req.sender, req.recipient, req.amount, req.fee);
    if let Some(id) = req.id {
        tx = tx.with_id(id);
    }
    tx.signature = req.signature;

    if !state.chain.submit_transaction(tx.clone())? {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("Transaction {} is already in the mempool", tx.id),
        ));
    }
    Ok(Json(json!({
        "success": true,
        "message": "Transaction added to mempool",
        "transaction": tx,
        "mempool_size": state.chain.pool().size(),
    })))
}

async fn get_mempool(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "success": true, "mempool": state.chain.pool().summary() }))
}

#[derive(Debug, Default, Deserialize)]
struct MineRequest {
    #[serde(default)]
    transactions: Option<Vec<Transaction>>,
    #[serde(default)]
    miner_address: Option<String>,
}

/// Starts a background job; the mined block is broadcast once appended.
async fn start_mining(State(state): State<AppState>, Json(req): Json<MineRequest>) -> ApiResult {
    let miner_address = req
        .miner_address
        .unwrap_or_else(|| DEFAULT_MINER_ADDRESS.to_string());
    let transactions = req.transactions.filter(|txs| !txs.is_empty());

    let runtime = Handle::current();
    let network = Arc::clone(&state.network);
    let job_id = state
        .chain
        .start_mining_with(&miner_address, transactions, move |block| {
            runtime.spawn(async move {
                network.broadcast_block(&block).await;
            });
        })?;
    info!(%job_id, "mining job started");
    Ok(Json(json!({ "success": true, "message": "Mining started", "job_id": job_id })))
}

async fn mining_status(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult {
    let status = state
        .chain
        .miner()
        .get_job_status(&job_id)
        .ok_or_else(|| ApiError::from(LedgerError::JobNotFound(job_id)))?;
    Ok(Json(json!({ "success": true, "status": status })))
}

async fn cancel_mining(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult {
    if !state.chain.miner().cancel_job(&job_id) {
        return Err(ApiError::not_found("Job not found or already finished"));
    }
    Ok(Json(json!({ "success": true, "message": "Mining job cancelled" })))
}

async fn mining_jobs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "success": true, "jobs": state.chain.miner().get_all_jobs() }))
}

#[derive(Debug, Deserialize)]
struct ProofRequest {
    tx_hash: String,
    proof: Vec<ProofStep>,
    merkle_root: String,
}

async fn verify_tx_proof(Json(req): Json<ProofRequest>) -> Json<Value> {
    let is_valid = MerkleTree::verify_proof(&req.tx_hash, &req.proof, &req.merkle_root);
    Json(json!({ "success": true, "is_valid": is_valid }))
}

async fn get_peers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "success": true, "peers": state.network.get_peers() }))
}

#[derive(Debug, Deserialize)]
struct PeerRequest {
    address: String,
    port: u16,
}

impl PeerRequest {
    fn checked(self) -> Result<Self, ApiError> {
        if self.address.trim().is_empty() || self.port == 0 {
            return Err(ApiError::bad_request("Missing address or port"));
        }
        Ok(self)
    }
}

async fn add_peer(State(state): State<AppState>, Json(req): Json<PeerRequest>) -> ApiResult {
    let req = req.checked()?;
    let peer = state.network.add_peer(&req.address, req.port);
    Ok(Json(json!({ "success": true, "message": "Peer added", "peer": peer })))
}

/// Fetches the peer's chain and hands it to the longest-valid-chain rule.
async fn sync_from_peer(State(state): State<AppState>, Json(req): Json<PeerRequest>) -> ApiResult {
    let req = req.checked()?;
    let Some(candidate) = state.network.sync_chain(&req.address, req.port).await else {
        return Err(ApiError::new(StatusCode::BAD_GATEWAY, "Failed to sync from peer"));
    };

    let chain = Arc::clone(&state.chain);
    let replaced = tokio::task::spawn_blocking(move || chain.replace_chain(candidate)).await?;
    if !replaced {
        warn!(peer = %format!("{}:{}", req.address, req.port), "peer chain not adopted");
        return Err(ApiError::bad_request("Failed to replace chain"));
    }
    Ok(Json(json!({
        "success": true,
        "message": "Chain synced successfully",
        "length": state.chain.len(),
    })))
}

async fn discover_peers(State(state): State<AppState>, Json(req): Json<PeerRequest>) -> ApiResult {
    let req = req.checked()?;
    let seed = state.network.add_peer(&req.address, req.port);
    let discovered = state.network.discover_peers(&seed, state.own.as_ref()).await;
    Ok(Json(json!({ "success": true, "discovered": discovered })))
}

async fn get_stats(State(state): State<AppState>) -> ApiResult {
    let chain = Arc::clone(&state.chain);
    let stats = tokio::task::spawn_blocking(move || chain.get_stats()).await?;
    Ok(Json(json!({
        "success": true,
        "stats": stats,
        "peers": state.network.len(),
        "active_peers": state.network.get_active_peers().len(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct KeyRequest {
    #[serde(default)]
    name: Option<String>,
}

async fn create_key(State(state): State<AppState>, Json(req): Json<KeyRequest>) -> Json<Value> {
    let name = req
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("key_{}", &Uuid::new_v4().simple().to_string()[..8]));
    let key = state.keys.create_key(&name);
    Json(json!({
        "success": true,
        "message": "Key created",
        "key": { "name": name, "address": key.address(), "public_key": key.public_key_hex() },
    }))
}

async fn list_keys(State(state): State<AppState>) -> Json<Value> {
    let keys: Vec<Value> = state
        .keys
        .list_keys()
        .into_iter()
        .filter_map(|name| {
            let key = state.keys.get_key(&name)?;
            Some(json!({ "name": name, "address": key.address(), "public_key": key.public_key_hex() }))
        })
        .collect();
    Json(json!({ "success": true, "keys": keys }))
}
