use anyhow::{Context, Result};
use blocksim_core::constants::STATE_KEY;
use blocksim_core::StateStore;
use serde_json::Value;
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info};

const TREE_STATE: &str = "state";

#[derive(Clone)]
pub struct SledStore {
  db: Db,
  state: Tree,
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let db = sled::open(path)
      .with_context(|| format!("opening sled store at {}", path.display()))?;
    let state = db.open_tree(TREE_STATE).context("opening state tree")?;
    info!(path = %path.display(), "sled store opened");
    Ok(Self { db, state })
  }

  pub fn flush(&self) -> Result<()> {
    self.db.flush()?;
    Ok(())
  }

  /// Flush pending writes. The lock is released when the last clone drops.
  pub fn close(&self) -> Result<()> {
    self.flush()
  }
}

impl StateStore for SledStore {
  fn load(&self) -> Result<Option<Value>> {
    match self.state.get(STATE_KEY)? {
      Some(bytes) => {
        let value = serde_json::from_slice(&bytes)
          .with_context(|| format!("decoding `{STATE_KEY}`"))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  fn save(&self, state: &Value) -> Result<()> {
    let bytes = serde_json::to_vec(state)?;
    let len = bytes.len();
    self.state.insert(STATE_KEY, bytes)?;
    self.db.flush()?;
    debug!(bytes = len, "state saved");
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self.state.remove(STATE_KEY)?;
    self.db.flush()?;
    debug!("state cleared");
    Ok(())
  }
}
