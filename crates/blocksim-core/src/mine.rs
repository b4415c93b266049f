//! Resumable Proof-of-Work nonce search.
//!
//! A [`PowSearch`] never blocks for longer than one batch: callers drive it
//! with [`PowSearch::step`] and are free to refresh, cancel or yield between
//! calls. [`mine_block`] is the plain synchronous driver.

use crate::consensus::is_hash_valid;
use crate::constants::MINING_BATCH_SIZE;
use crate::{Block, Hash, HashTemplate, Seal};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Snapshot pushed to the caller after every batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchProgress {
    /// Last nonce tried.
    pub nonce: u64,
    pub last_hash: Hash,
    pub attempts: u64,
    pub elapsed: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchStep {
    Continue(SearchProgress),
    Found {
        nonce: u64,
        hash: Hash,
        progress: SearchProgress,
    },
    TimedOut(SearchProgress),
}

/// Terminal result of a search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MineOutcome {
    Mined {
        nonce: u64,
        hash: Hash,
        attempts: u64,
        elapsed: Duration,
    },
    TimedOut {
        attempts: u64,
        elapsed: Duration,
    },
}

impl MineOutcome {
    pub fn is_mined(&self) -> bool {
        matches!(self, MineOutcome::Mined { .. })
    }
}

#[derive(Debug)]
enum State {
    Searching,
    Found(u64, Hash),
    TimedOut,
}

#[derive(Debug)]
pub struct PowSearch {
    template: HashTemplate,
    difficulty: u32,
    next_nonce: u64,
    attempts: u64,
    last_hash: Hash,
    started: Instant,
    timeout: Option<Duration>,
    state: State,
}

impl PowSearch {
    /// Search nonces from 0 for `block` at its own difficulty. The clock
    /// starts now; there is no timeout until [`PowSearch::with_timeout`].
    pub fn new(block: &Block) -> Self {
        Self {
            template: HashTemplate::of(block),
            difficulty: block.difficulty,
            next_nonce: 0,
            attempts: 0,
            last_hash: String::new(),
            started: Instant::now(),
            timeout: None,
            state: State::Searching,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    fn progress(&self) -> SearchProgress {
        SearchProgress {
            nonce: self.next_nonce.saturating_sub(1),
            last_hash: self.last_hash.clone(),
            attempts: self.attempts,
            elapsed: self.started.elapsed(),
        }
    }

    /// Try at most `budget` nonces (at least one). The timeout is checked
    /// only between batches, never mid-batch. Once terminal, further calls
    /// return the same result without hashing.
    pub fn step(&mut self, budget: u64) -> SearchStep {
        match &self.state {
            State::Found(nonce, hash) => {
                return SearchStep::Found {
                    nonce: *nonce,
                    hash: hash.clone(),
                    progress: self.progress(),
                }
            }
            State::TimedOut => return SearchStep::TimedOut(self.progress()),
            State::Searching => {}
        }

        for _ in 0..budget.max(1) {
            let nonce = self.next_nonce;
            let hash = self.template.hash(nonce);
            self.attempts += 1;
            self.next_nonce = nonce.wrapping_add(1);
            if is_hash_valid(&hash, self.difficulty) {
                self.last_hash = hash.clone();
                self.state = State::Found(nonce, hash.clone());
                return SearchStep::Found {
                    nonce,
                    hash,
                    progress: self.progress(),
                };
            }
            self.last_hash = hash;
        }

        if let Some(timeout) = self.timeout {
            if self.started.elapsed() >= timeout {
                debug!(attempts = self.attempts, "nonce search timed out");
                self.state = State::TimedOut;
                return SearchStep::TimedOut(self.progress());
            }
        }
        SearchStep::Continue(self.progress())
    }

    /// Drive the search to a terminal outcome in `batch`-sized slices,
    /// reporting progress after each one.
    pub fn run<F: FnMut(&SearchProgress)>(mut self, batch: u64, mut on_progress: F) -> MineOutcome {
        loop {
            match self.step(batch) {
                SearchStep::Continue(progress) => on_progress(&progress),
                SearchStep::Found {
                    nonce,
                    hash,
                    progress,
                } => {
                    on_progress(&progress);
                    return MineOutcome::Mined {
                        nonce,
                        hash,
                        attempts: progress.attempts,
                        elapsed: progress.elapsed,
                    };
                }
                SearchStep::TimedOut(progress) => {
                    on_progress(&progress);
                    return MineOutcome::TimedOut {
                        attempts: progress.attempts,
                        elapsed: progress.elapsed,
                    };
                }
            }
        }
    }
}

/// Store a successful outcome on `block` as its Proof-of-Work seal.
/// Leaves the block untouched on timeout.
pub fn apply_outcome(block: &mut Block, outcome: &MineOutcome) {
    if let MineOutcome::Mined { nonce, hash, .. } = outcome {
        block.seal = Seal::ProofOfWork { nonce: *nonce };
        block.hash = hash.clone();
    }
}

/// Mine `block` in place at its own difficulty.
pub fn mine_block<F: FnMut(&SearchProgress)>(
    block: &mut Block,
    timeout: Option<Duration>,
    on_progress: F,
) -> MineOutcome {
    let mut search = PowSearch::new(block);
    if let Some(timeout) = timeout {
        search = search.with_timeout(timeout);
    }
    let outcome = search.run(MINING_BATCH_SIZE, on_progress);
    apply_outcome(block, &outcome);
    if let MineOutcome::Mined {
        nonce,
        hash,
        attempts,
        ..
    } = &outcome
    {
        info!(
            "Mined block {} with nonce {} after {} attempts, hash {}",
            block.index, nonce, attempts, hash
        );
    }
    outcome
}
