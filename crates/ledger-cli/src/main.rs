use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "CLI client for the proof-of-work ledger node")]
struct Cli {
    /// Node base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:5000")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a transaction to the mempool
    Submit {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        #[arg(long, default_value_t = 0)]
        fee: u64,
    },
    /// Start mining pending transactions
    Mine {
        /// Coinbase recipient
        #[arg(long)]
        miner: Option<String>,
        /// Poll the job until it finishes
        #[arg(long)]
        wait: bool,
    },
    /// Show a mining job
    Status { job_id: String },
    /// Cancel a mining job
    Cancel { job_id: String },
    /// Dump the whole chain
    Chain,
    /// Show one block and its Merkle tree
    Block { index: u64 },
    /// Merkle proof for a transaction of a block
    Proof { index: u64, tx: usize },
    /// List known peers
    Peers,
    /// Register a peer
    AddPeer { address: String, port: u16 },
    /// Pull a peer's chain and adopt it if longer and valid
    Sync { address: String, port: u16 },
    /// Ask a peer for the peers it knows
    Discover { address: String, port: u16 },
    /// Aggregate chain figures
    Stats,
}

#[derive(Serialize)]
struct TxIn {
    sender: String,
    recipient: String,
    amount: u64,
    fee: u64,
}

struct NodeClient {
    client: Client,
    base: String,
}

impl NodeClient {
    fn new(base: &str) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<(u16, Value)> {
        let url = format!("{}{path}", self.base);
        debug!(%method, %url, "request");
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let res = request.send().await.with_context(|| format!("requesting {url}"))?;
        let status = res.status().as_u16();
        let body = res.json().await.with_context(|| format!("decoding response from {url}"))?;
        Ok((status, body))
    }

    async fn get(&self, path: &str) -> Result<(u16, Value)> {
        self.call(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<(u16, Value)> {
        self.call(Method::POST, path, Some(body)).await
    }
}

fn print_response((status, body): (u16, Value)) -> Result<()> {
    println!("status: {status}");
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn peer_body(address: String, port: u16) -> Value {
    json!({ "address": address, "port": port })
}

async fn wait_for_job(node: &NodeClient, job_id: &str) -> Result<(u16, Value)> {
    loop {
        let (status, body) = node.get(&format!("/mine/status/{job_id}")).await?;
        let job = &body["status"];
        let finished = ["is_complete", "is_cancelled", "is_failed"]
            .iter()
            .any(|flag| job[*flag] == true);
        if status != 200 || finished {
            return Ok((status, body));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let node = NodeClient::new(&cli.node);
    let response = match cli.cmd {
        Command::Submit { from, to, amount, fee } => {
            let tx = TxIn {
                sender: from,
                recipient: to,
                amount,
                fee,
            };
            node.post("/transactions", serde_json::to_value(tx)?).await?
        }
        Command::Mine { miner, wait } => {
            let started = node.post("/mine", json!({ "miner_address": miner })).await?;
            if !wait || started.0 != 200 {
                started
            } else {
                let Some(job_id) = started.1["job_id"].as_str() else {
                    bail!("node did not return a job id");
                };
                wait_for_job(&node, job_id).await?
            }
        }
        Command::Status { job_id } => node.get(&format!("/mine/status/{job_id}")).await?,
        Command::Cancel { job_id } => node.post(&format!("/mine/cancel/{job_id}"), json!({})).await?,
        Command::Chain => node.get("/chain").await?,
        Command::Block { index } => node.get(&format!("/blocks/{index}")).await?,
        Command::Proof { index, tx } => node.get(&format!("/blocks/{index}/proof/{tx}")).await?,
        Command::Peers => node.get("/peers").await?,
        Command::AddPeer { address, port } => node.post("/peers", peer_body(address, port)).await?,
        Command::Sync { address, port } => node.post("/peers/sync", peer_body(address, port)).await?,
        Command::Discover { address, port } => {
            node.post("/peers/discover", peer_body(address, port)).await?
        }
        Command::Stats => node.get("/stats").await?,
    };
    print_response(response)
}
