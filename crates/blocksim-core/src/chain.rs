//! The ledger: an ordered chain of blocks plus the pending transaction pool.
//!
//! Invalid chains are allowed to exist. Every append or tamper is followed by
//! a full revalidation that records each block's [`BlockStatus`] in place.

use crate::constants::{
    DEFAULT_DIFFICULTY, GENESIS_DIFFICULTY, GENESIS_PREVIOUS_HASH, MAX_BLOCK_TXS, MINING_TIMEOUT,
};
use crate::consensus::{is_hash_valid, ConsensusType, ValidatorSet};
use crate::mine::{mine_block, MineOutcome, SearchProgress};
use crate::{Block, BlockStatus, Hash, InvalidReason, Payload, Seal, SimError, Transaction, TxField};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DUMMY_NAMES: [&str; 6] = ["Alice", "Bob", "Charlie", "Dave", "Eve", "Frank"];

/// How one block's failure affects the blocks after it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityPolicy {
    /// Each block reports only its own checks.
    #[default]
    LocalOnly,
    /// Every block after the first invalid one is reported invalid too.
    Cascading,
}

impl fmt::Display for ValidityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidityPolicy::LocalOnly => write!(f, "local"),
            ValidityPolicy::Cascading => write!(f, "cascading"),
        }
    }
}

impl FromStr for ValidityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "local-only" => Ok(Self::LocalOnly),
            "cascading" | "cascade" => Ok(Self::Cascading),
            other => Err(format!("unknown validity policy `{other}` (expected local or cascading)")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub difficulty: u32,
    pub consensus: ConsensusType,
    pub policy: ValidityPolicy,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            consensus: ConsensusType::default(),
            policy: ValidityPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Blockchain {
    chain: Vec<Block>,
    mempool: Vec<Transaction>,
    difficulty: u32,
    consensus: ConsensusType,
    #[serde(default)]
    policy: ValidityPolicy,
    #[serde(skip)]
    validators: ValidatorSet,
}

/// Mine the bootstrap block. Always Proof-of-Work, whatever the chain uses.
pub fn genesis_block() -> Result<Block, SimError> {
    let mut genesis = Block::with_transactions(
        0,
        vec![],
        GENESIS_PREVIOUS_HASH.to_string(),
        GENESIS_DIFFICULTY,
    );
    match mine_block(&mut genesis, Some(MINING_TIMEOUT), |_| {}) {
        MineOutcome::Mined { .. } => Ok(genesis),
        MineOutcome::TimedOut { attempts, .. } => Err(SimError::Genesis(format!(
            "no nonce found after {attempts} attempts"
        ))),
    }
}

/// Checks for `block` against its predecessor, in order; the first failure
/// wins. Proof-of-Work is only checked when no validator is attached.
pub fn validate_block(block: &Block, previous: Option<&Block>) -> BlockStatus {
    let Some(previous) = previous else {
        return BlockStatus::invalid(InvalidReason::PreviousBlockMissing, None);
    };
    if block.previous_hash != previous.hash {
        return BlockStatus::invalid(InvalidReason::PreviousHashMismatch, None);
    }
    let calculated = block.calculate_hash();
    if calculated != block.hash {
        return BlockStatus::invalid(InvalidReason::HashMismatch, Some(calculated));
    }
    if block.validator().is_none() && !is_hash_valid(&block.hash, block.difficulty) {
        return BlockStatus::invalid(
            InvalidReason::InsufficientWork {
                difficulty: block.difficulty,
            },
            Some(calculated),
        );
    }
    BlockStatus {
        is_valid: true,
        invalid_reason: None,
        calculated_hash: Some(calculated),
    }
}

impl Blockchain {
    /// Start a session: an empty mempool and a freshly mined genesis block.
    pub fn new(config: ChainConfig) -> Result<Self, SimError> {
        let genesis = genesis_block()?;
        info!(hash = %genesis.hash, nonce = genesis.nonce(), "genesis block created");
        Ok(Self {
            chain: vec![genesis],
            mempool: Vec::new(),
            difficulty: config.difficulty,
            consensus: config.consensus,
            policy: config.policy,
            validators: ValidatorSet::default(),
        })
    }

    pub fn with_validators(mut self, validators: ValidatorSet) -> Self {
        self.validators = validators;
        self
    }

    pub fn config(&self) -> ChainConfig {
        ChainConfig {
            difficulty: self.difficulty,
            consensus: self.consensus,
            policy: self.policy,
        }
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn mempool(&self) -> &[Transaction] {
        &self.mempool
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        self.chain.get(index)
    }

    pub fn latest_block(&self) -> Option<&Block> {
        self.chain.last()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Applies to blocks assembled from now on.
    pub fn set_difficulty(&mut self, difficulty: u32) {
        self.difficulty = difficulty;
    }

    pub fn consensus(&self) -> ConsensusType {
        self.consensus
    }

    pub fn set_consensus(&mut self, consensus: ConsensusType) {
        self.consensus = consensus;
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn policy(&self) -> ValidityPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ValidityPolicy) {
        self.policy = policy;
        self.validate_chain();
    }

    pub fn add_transaction(
        &mut self,
        sender: &str,
        receiver: &str,
        amount: f64,
    ) -> Result<Transaction, SimError> {
        let tx = Transaction::new(sender, receiver, amount)?;
        debug!(id = %tx.id, "transaction added to mempool");
        self.mempool.push(tx.clone());
        Ok(tx)
    }

    /// Returns whether a transaction was removed.
    pub fn remove_transaction(&mut self, id: &str) -> bool {
        let before = self.mempool.len();
        self.mempool.retain(|tx| tx.id != id);
        self.mempool.len() != before
    }

    /// Add a random transfer between two distinct demo names, 1 to 100 coins.
    pub fn generate_transaction<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Transaction, SimError> {
        let sender = rng.gen_range(0..DUMMY_NAMES.len());
        let receiver = (sender + rng.gen_range(1..DUMMY_NAMES.len())) % DUMMY_NAMES.len();
        let amount = f64::from(rng.gen_range(1u32..=100));
        self.add_transaction(DUMMY_NAMES[sender], DUMMY_NAMES[receiver], amount)
    }

    fn tip_hash(&self) -> Hash {
        self.latest_block()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string())
    }

    /// Unsealed block over the oldest pending transactions, linked to the tip.
    pub fn candidate_block(&self) -> Block {
        let txs = self.mempool.iter().take(MAX_BLOCK_TXS).cloned().collect();
        Block::with_transactions(self.chain.len() as u64, txs, self.tip_hash(), self.difficulty)
    }

    /// Unsealed block for the single-string variant, linked to the tip.
    pub fn candidate_data_block(&self, data: impl Into<String>) -> Block {
        Block::with_data(self.chain.len() as u64, data, self.tip_hash(), self.difficulty)
    }

    /// Append `block` even when it does not link to the tip; such a block is
    /// recorded as invalid. Mempool entries whose ids the block carries are
    /// dropped, and the whole chain is revalidated.
    pub fn add_block(&mut self, mut block: Block) -> &Block {
        let tip = self.tip_hash();
        if block.previous_hash != tip {
            warn!(index = block.index, "previous hash mismatch on admission");
            block.status = BlockStatus::invalid(InvalidReason::PreviousHashMismatch, None);
        }

        let mined: HashSet<&str> = block.transactions().iter().map(|tx| tx.id.as_str()).collect();
        self.mempool.retain(|tx| !mined.contains(tx.id.as_str()));

        info!(index = block.index, hash = %block.hash, txs = block.transactions().len(), "block admitted");
        self.chain.push(block);
        self.validate_chain();
        &self.chain[self.chain.len() - 1]
    }

    fn block_mut(&mut self, index: usize) -> Result<&mut Block, SimError> {
        self.chain.get_mut(index).ok_or(SimError::BlockNotFound(index))
    }

    /// Overwrite one field of an admitted transaction, then revalidate.
    pub fn tamper_block_transaction(
        &mut self,
        block_index: usize,
        tx_index: usize,
        field: TxField,
        value: &str,
    ) -> Result<(), SimError> {
        let block = self.block_mut(block_index)?;
        let tx = match &mut block.payload {
            Payload::Transactions(txs) => txs.get_mut(tx_index),
            Payload::Data(_) => None,
        }
        .ok_or(SimError::TransactionNotFound {
            block: block_index,
            tx: tx_index,
        })?;
        tx.set_field(field, value)?;
        debug!(block_index, tx_index, ?field, "transaction tampered");
        self.validate_chain();
        Ok(())
    }

    pub fn tamper_previous_hash(&mut self, block_index: usize, value: &str) -> Result<(), SimError> {
        self.block_mut(block_index)?.previous_hash = value.to_string();
        debug!(block_index, "previous hash tampered");
        self.validate_chain();
        Ok(())
    }

    pub fn tamper_block_data(&mut self, block_index: usize, value: &str) -> Result<(), SimError> {
        match &mut self.block_mut(block_index)?.payload {
            Payload::Data(data) => *data = value.to_string(),
            Payload::Transactions(_) => return Err(SimError::NotADataBlock(block_index)),
        }
        debug!(block_index, "block data tampered");
        self.validate_chain();
        Ok(())
    }

    /// Reseal an admitted block over its current contents. Proof-of-Work
    /// blocks rerun the nonce search from zero and are left untouched on
    /// timeout; Proof-of-Stake blocks are rehashed with nonce 0 under their
    /// existing validator and report a single attempt. The previous hash is
    /// never repaired.
    pub fn remine_block<F: FnMut(&SearchProgress)>(
        &mut self,
        index: usize,
        timeout: Option<Duration>,
        on_progress: F,
    ) -> Result<MineOutcome, SimError> {
        let block = self.block_mut(index)?;
        let outcome = if matches!(block.seal, Seal::ProofOfStake { .. }) {
            let started = Instant::now();
            block.hash = block.calculate_hash();
            MineOutcome::Mined {
                nonce: 0,
                hash: block.hash.clone(),
                attempts: 1,
                elapsed: started.elapsed(),
            }
        } else {
            mine_block(block, timeout, on_progress)
        };
        if outcome.is_mined() {
            self.validate_chain();
        } else {
            warn!(index, "re-mining timed out");
        }
        Ok(outcome)
    }

    /// Recompute every block's status. Genesis is always valid.
    pub fn validate_chain(&mut self) {
        let policy = self.policy;
        let mut broken = false;
        for i in 0..self.chain.len() {
            let status = if i == 0 {
                BlockStatus::valid()
            } else {
                let (before, rest) = self.chain.split_at(i);
                let local = validate_block(&rest[0], before.last());
                if broken && local.is_valid && policy == ValidityPolicy::Cascading {
                    BlockStatus::invalid(InvalidReason::PreviousBlockInvalid, local.calculated_hash)
                } else {
                    local
                }
            };
            if !status.is_valid {
                if let Some(reason) = &status.invalid_reason {
                    warn!(index = i, %reason, "block failed validation");
                }
                broken = true;
            }
            self.chain[i].status = status;
        }
    }

    pub fn is_chain_valid(&self) -> bool {
        self.chain.iter().all(Block::is_valid)
    }

    /// Blocks built on top of `index`; zero for the tip or an unknown index.
    pub fn confirmations(&self, index: usize) -> usize {
        self.chain.len().saturating_sub(1).saturating_sub(index)
    }
}
