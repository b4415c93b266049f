use thiserror::Error;

/// Failures reported synchronously to the caller. Nothing is mutated when
/// one of these is returned.
///
/// Structural invalidity of a block (broken link, tampered data, missing
/// work) is not an error; see [`crate::BlockStatus`].
#[derive(Debug, Error)]
pub enum SimError {
    #[error("{0} must not be empty")]
    EmptyParty(&'static str),

    #[error("amount must be a positive number, got {0}")]
    NonPositiveAmount(f64),

    #[error("cannot build a Merkle tree with no leaves")]
    EmptyMerkleTree,

    #[error("leaf index {index} out of bounds for {total} leaves")]
    LeafIndexOutOfBounds { index: usize, total: usize },

    #[error("tree does not have the shape of {0} leaves")]
    TreeShapeMismatch(usize),

    #[error("no block at index {0}")]
    BlockNotFound(usize),

    #[error("block {block} has no transaction at index {tx}")]
    TransactionNotFound { block: usize, tx: usize },

    #[error("block {0} does not carry a data payload")]
    NotADataBlock(usize),

    #[error("unknown transaction field `{0}`")]
    UnknownField(String),

    #[error("invalid value `{value}` for field `{field}`")]
    InvalidFieldValue { field: &'static str, value: String },

    #[error("validator set must contain at least one validator with positive stake")]
    EmptyValidatorSet,

    #[error("a mining race needs at least one contender")]
    NoContenders,

    #[error("genesis block could not be mined: {0}")]
    Genesis(String),

    #[error("state snapshot: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
