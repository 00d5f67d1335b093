use anyhow::{Context, Result};
use ledger_core::{Block, ChainStore};
use sled::{Db, IVec, Tree};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const TREE_BLOCKS: &str = "blocks";
const KEY_TIP_HEIGHT: &[u8] = b"tip_height";

/// Blocks keyed by big-endian index, so iteration order is chain order.
/// Values are the JSON block record served to peers.
#[derive(Clone)]
pub struct SledStore {
  db: Db,
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let db = sled::open(path).with_context(|| format!("opening sled db at {}", path.display()))?;
    info!(path = %path.display(), "sled store opened");
    Ok(Self { db })
  }

  fn blocks(&self) -> Result<Tree> {
    self.db.open_tree(TREE_BLOCKS).context("opening blocks tree")
  }

  /// Index of the last saved block, if any.
  pub fn tip_height(&self) -> Result<Option<u64>> {
    self
      .db
      .get(KEY_TIP_HEIGHT)?
      .map(|v| decode_index(&v))
      .transpose()
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.blocks()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.blocks()?.is_empty())
  }
}

fn decode_index(bytes: &IVec) -> Result<u64> {
  let arr: [u8; 8] = bytes
    .as_ref()
    .try_into()
    .context("block index key is not 8 bytes")?;
  Ok(u64::from_be_bytes(arr))
}

fn decode_block(bytes: &IVec) -> Result<Block> {
  serde_json::from_slice(bytes).context("decoding stored block record")
}

impl ChainStore for SledStore {
  fn save_block(&self, block: &Block) -> Result<()> {
    let tree = self.blocks()?;
    let key = block.index().to_be_bytes();
    let bytes = serde_json::to_vec(block)?;
    tree.insert(key, bytes)?;

    // track tip
    let tip = self.tip_height()?;
    if tip.map_or(true, |t| block.index() >= t) {
      self.db.insert(KEY_TIP_HEIGHT, &key)?;
    }

    self.db.flush()?;
    debug!(index = block.index(), "block saved");
    Ok(())
  }

  fn load_chain(&self) -> Result<Vec<Block>> {
    self
      .blocks()?
      .iter()
      .values()
      .map(|v| decode_block(&v?))
      .collect()
  }

  fn get_block(&self, index: u64) -> Result<Option<Block>> {
    let tree = self.blocks()?;
    tree.get(index.to_be_bytes())?.map(|v| decode_block(&v)).transpose()
  }

  fn clear_chain(&self) -> Result<()> {
    self.blocks()?.clear()?;
    self.db.remove(KEY_TIP_HEIGHT)?;
    self.db.flush()?;
    info!("stored chain cleared");
    Ok(())
  }

  fn snapshot(&self, path: &Path) -> Result<()> {
    let chain = self.load_chain()?;
    let json = serde_json::to_string_pretty(&chain)?;
    fs::write(path, json).with_context(|| format!("writing snapshot to {}", path.display()))?;
    info!(blocks = chain.len(), path = %path.display(), "chain snapshot written");
    Ok(())
  }

  /// Flushes pending writes; the handle stays usable.
  fn close(&self) -> Result<()> {
    self.db.flush()?;
    info!("sled store flushed");
    Ok(())
  }
}
