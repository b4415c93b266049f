use std::time::Duration;

pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;

/// Previous-hash value carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";
/// Genesis is always mined at this difficulty, whatever the chain uses.
pub const GENESIS_DIFFICULTY: u32 = 3;
pub const DEFAULT_DIFFICULTY: u32 = 3;
/// A hex digest has no more leading zeros to ask for.
pub const MAX_DIFFICULTY: u32 = HASH_HEX_SIZE as u32;

/// Hash attempts per scheduling slice of a PoW search.
pub const MINING_BATCH_SIZE: u64 = 500;
pub const MINING_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound of mempool transactions pulled into a candidate block.
pub const MAX_BLOCK_TXS: usize = 10;

pub const BLOCK_REWARD: u64 = 50;
/// Expected race duration in seconds is `difficulty * DIFFICULTY_SCALE / hash_rate`.
pub const DIFFICULTY_SCALE: f64 = 100.0;
/// Simulated time advanced per race tick.
pub const RACE_TICK: Duration = Duration::from_millis(50);
/// Longer races are replayed with a coarser tick.
pub const MAX_RACE_TICKS: u32 = 10_000;
pub const MIN_BOTS: usize = 5;
pub const MAX_BOTS: usize = 8;

/// Single key under which the whole session is persisted.
pub const STATE_KEY: &str = "blocksim_state_v1";
