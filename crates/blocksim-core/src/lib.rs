use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub mod chain;
pub mod consensus;
pub mod constants;
pub mod error;
pub mod merkle;
pub mod mine;
pub mod race;
pub mod session;

pub use chain::{Blockchain, ChainConfig, ValidityPolicy};
pub use consensus::{ConsensusType, Validator, ValidatorSet};
pub use error::SimError;
pub use merkle::{Direction, MerkleNode, ProofStep};
pub use mine::{MineOutcome, PowSearch, SearchProgress, SearchStep};
pub use race::{Leaderboard, MinerProfile, MiningRace, RaceResult};
pub use session::{MemoryStore, Session, StateStore};

/// Lowercase hex SHA-256 digest, always 64 characters.
pub type Hash = String;

pub fn sha256_hex(input: impl AsRef<[u8]>) -> Hash {
    hex::encode(Sha256::digest(input.as_ref()))
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub timestamp: u64,
}

impl Transaction {
    /// Build a new transfer with a fresh id. Rejects empty parties and
    /// non-positive (or non-finite) amounts.
    pub fn new(sender: &str, receiver: &str, amount: f64) -> Result<Self, SimError> {
        if sender.trim().is_empty() {
            return Err(SimError::EmptyParty("sender"));
        }
        if receiver.trim().is_empty() {
            return Err(SimError::EmptyParty("receiver"));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(SimError::NonPositiveAmount(amount));
        }
        Ok(Self {
            id: Uuid::new_v4().simple().to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            amount,
            timestamp: now_millis(),
        })
    }

    /// Overwrite one field in place, bypassing the checks in [`Transaction::new`].
    pub fn set_field(&mut self, field: TxField, value: &str) -> Result<(), SimError> {
        match field {
            TxField::Id => self.id = value.to_string(),
            TxField::Sender => self.sender = value.to_string(),
            TxField::Receiver => self.receiver = value.to_string(),
            TxField::Amount => {
                // Zero and negative amounts may be tampered in; NaN and
                // infinities cannot be persisted as JSON numbers.
                self.amount = value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|amount| amount.is_finite())
                    .ok_or_else(|| SimError::InvalidFieldValue {
                        field: "amount",
                        value: value.to_string(),
                    })?
            }
            TxField::Timestamp => {
                self.timestamp = value
                    .trim()
                    .parse()
                    .map_err(|_| SimError::InvalidFieldValue {
                        field: "timestamp",
                        value: value.to_string(),
                    })?
            }
        }
        Ok(())
    }

    /// Merkle leaf content for this transaction.
    pub fn leaf(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxField {
    Id,
    Sender,
    Receiver,
    Amount,
    Timestamp,
}

impl FromStr for TxField {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(Self::Id),
            "sender" | "from" => Ok(Self::Sender),
            "receiver" | "to" => Ok(Self::Receiver),
            "amount" => Ok(Self::Amount),
            "timestamp" => Ok(Self::Timestamp),
            other => Err(SimError::UnknownField(other.to_string())),
        }
    }
}

/// What a block carries: a transaction list, or a single opaque string for
/// the simplified teaching variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Transactions(Vec<Transaction>),
    Data(String),
}

impl Payload {
    /// Stable text form used inside the block hash. Transactions are JSON
    /// encoded in declaration order, so equal content always hashes equal.
    pub fn canonical(&self) -> String {
        match self {
            // Plain structs with string keys cannot fail to serialize.
            Payload::Transactions(txs) => serde_json::to_string(txs).unwrap_or_default(),
            Payload::Data(data) => data.clone(),
        }
    }

    pub fn transactions(&self) -> &[Transaction] {
        match self {
            Payload::Transactions(txs) => txs,
            Payload::Data(_) => &[],
        }
    }
}

/// How a block was sealed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "consensus", rename_all = "snake_case")]
pub enum Seal {
    ProofOfWork { nonce: u64 },
    ProofOfStake { validator: Validator },
}

impl Seal {
    /// Proof-of-Stake blocks always hash with nonce 0.
    pub fn nonce(&self) -> u64 {
        match self {
            Seal::ProofOfWork { nonce } => *nonce,
            Seal::ProofOfStake { .. } => 0,
        }
    }

    pub fn validator(&self) -> Option<&Validator> {
        match self {
            Seal::ProofOfWork { .. } => None,
            Seal::ProofOfStake { validator } => Some(validator),
        }
    }

    pub fn consensus_type(&self) -> ConsensusType {
        match self {
            Seal::ProofOfWork { .. } => ConsensusType::ProofOfWork,
            Seal::ProofOfStake { .. } => ConsensusType::ProofOfStake,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InvalidReason {
    PreviousBlockMissing,
    PreviousHashMismatch,
    HashMismatch,
    InsufficientWork { difficulty: u32 },
    PreviousBlockInvalid,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::PreviousBlockMissing => write!(f, "Previous block missing"),
            InvalidReason::PreviousHashMismatch => write!(f, "Broken link: previous hash mismatch"),
            InvalidReason::HashMismatch => write!(f, "Data tampered: hash mismatch"),
            InvalidReason::InsufficientWork { difficulty } => {
                write!(f, "Invalid PoW: hash doesn't start with {difficulty} zeros")
            }
            InvalidReason::PreviousBlockInvalid => write!(f, "Previous block invalid"),
        }
    }
}

/// Validity as last computed by the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub is_valid: bool,
    pub invalid_reason: Option<InvalidReason>,
    /// Recomputed hash, kept for showing a mismatch next to the stored one.
    pub calculated_hash: Option<Hash>,
}

impl BlockStatus {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            calculated_hash: None,
        }
    }

    pub fn invalid(reason: InvalidReason, calculated_hash: Option<Hash>) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason),
            calculated_hash,
        }
    }
}

impl Default for BlockStatus {
    fn default() -> Self {
        Self::valid()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    pub payload: Payload,
    pub previous_hash: Hash,
    pub difficulty: u32,
    pub seal: Seal,
    /// Empty until the block is mined or validated.
    pub hash: Hash,
    #[serde(default)]
    pub status: BlockStatus,
}

impl Block {
    /// An unsealed Proof-of-Work block with nonce 0 and no hash yet.
    pub fn new(index: u64, payload: Payload, previous_hash: Hash, difficulty: u32) -> Self {
        Self {
            index,
            timestamp: now_millis(),
            payload,
            previous_hash,
            difficulty,
            seal: Seal::ProofOfWork { nonce: 0 },
            hash: String::new(),
            status: BlockStatus::valid(),
        }
    }

    pub fn with_transactions(
        index: u64,
        transactions: Vec<Transaction>,
        previous_hash: Hash,
        difficulty: u32,
    ) -> Self {
        Self::new(index, Payload::Transactions(transactions), previous_hash, difficulty)
    }

    pub fn with_data(index: u64, data: impl Into<String>, previous_hash: Hash, difficulty: u32) -> Self {
        Self::new(index, Payload::Data(data.into()), previous_hash, difficulty)
    }

    pub fn nonce(&self) -> u64 {
        self.seal.nonce()
    }

    pub fn validator(&self) -> Option<&Validator> {
        self.seal.validator()
    }

    pub fn transactions(&self) -> &[Transaction] {
        self.payload.transactions()
    }

    pub fn is_valid(&self) -> bool {
        self.status.is_valid
    }

    pub fn is_sealed(&self) -> bool {
        !self.hash.is_empty()
    }

    /// Canonical hash of the block's current fields:
    /// `index ‖ previous_hash ‖ timestamp ‖ payload ‖ nonce ‖ difficulty ‖ validator`.
    pub fn calculate_hash(&self) -> Hash {
        HashTemplate::of(self).hash(self.nonce())
    }

    /// Merkle root over the JSON of each transaction; `None` for data
    /// payloads and empty blocks.
    pub fn merkle_root(&self) -> Option<Hash> {
        let leaves: Vec<String> = self.transactions().iter().map(Transaction::leaf).collect();
        merkle::build_merkle_tree(&leaves)
            .ok()
            .map(|tree| merkle::get_merkle_root(&tree).to_string())
    }
}

/// Block hash input with everything but the nonce fixed, so a PoW search
/// only formats the nonce per attempt.
#[derive(Clone, Debug)]
pub struct HashTemplate {
    head: String,
    tail: String,
}

impl HashTemplate {
    pub fn of(block: &Block) -> Self {
        let head = format!(
            "{}{}{}{}",
            block.index,
            block.previous_hash,
            block.timestamp,
            block.payload.canonical()
        );
        let validator = block.validator().map(|v| v.name.as_str()).unwrap_or("");
        let tail = format!("{}{}", block.difficulty, validator);
        Self { head, tail }
    }

    pub fn hash(&self, nonce: u64) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.head.as_bytes());
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(self.tail.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(sender: &str, receiver: &str, amount: f64, timestamp: u64) -> Transaction {
        Transaction {
            id: format!("{sender}-{receiver}-{timestamp}"),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            amount,
            timestamp,
        }
    }

    fn sample_block() -> Block {
        let mut block = Block::with_transactions(
            1,
            vec![
                tx("Alice", "Bob", 10.0, 1_600_000_000_000),
                tx("Bob", "Charlie", 5.5, 1_600_000_100_000),
            ],
            "0".repeat(64),
            2,
        );
        block.timestamp = 1_600_000_200_000;
        block
    }

    #[test]
    fn sha256_known_vectors() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex("hello").len(), constants::HASH_HEX_SIZE);
    }

    #[test]
    fn sha256_single_char_change() {
        assert_ne!(sha256_hex("blocksim"), sha256_hex("blocksin"));
    }

    #[test]
    fn transaction_rejects_empty_parties() {
        assert!(matches!(
            Transaction::new("", "Bob", 1.0),
            Err(SimError::EmptyParty("sender"))
        ));
        assert!(matches!(
            Transaction::new("Alice", "   ", 1.0),
            Err(SimError::EmptyParty("receiver"))
        ));
    }

    #[test]
    fn transaction_rejects_non_positive_amounts() {
        for amount in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                Transaction::new("Alice", "Bob", amount),
                Err(SimError::NonPositiveAmount(_))
            ));
        }
    }

    #[test]
    fn transaction_ids_are_unique() {
        let a = Transaction::new("Alice", "Bob", 1.0).unwrap();
        let b = Transaction::new("Alice", "Bob", 1.0).unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.timestamp > 0);
    }

    #[test]
    fn set_field_parses_amount() {
        let mut t = tx("Alice", "Bob", 10.0, 1);
        t.set_field(TxField::Amount, "999").unwrap();
        assert_eq!(t.amount, 999.0);
        assert!(matches!(
            t.set_field(TxField::Amount, "lots"),
            Err(SimError::InvalidFieldValue { field: "amount", .. })
        ));
        assert_eq!(t.amount, 999.0);
        t.set_field(TxField::Amount, "-5").unwrap();
        assert_eq!(t.amount, -5.0);
        t.set_field("to".parse().unwrap(), "Mallory").unwrap();
        assert_eq!(t.receiver, "Mallory");
        assert!("colour".parse::<TxField>().is_err());
    }

    #[test]
    fn set_field_rejects_non_finite_amount() {
        let mut t = tx("Alice", "Bob", 10.0, 1);
        for value in ["NaN", "inf", "-infinity"] {
            assert!(matches!(
                t.set_field(TxField::Amount, value),
                Err(SimError::InvalidFieldValue { field: "amount", .. })
            ));
        }
        assert_eq!(t.amount, 10.0);
    }

    #[test]
    fn transaction_serialization_keeps_field_order() {
        let t = tx("Alice", "Bob", 10.0, 1_600_000_000);
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(
            json,
            r#"{"id":"Alice-Bob-1600000000","sender":"Alice","receiver":"Bob","amount":10.0,"timestamp":1600000000}"#
        );
    }

    #[test]
    fn canonical_hash_input_order() {
        let mut block = Block::with_data(7, "hello", "abc".to_string(), 4);
        block.timestamp = 42;
        block.seal = Seal::ProofOfWork { nonce: 9 };
        assert_eq!(block.calculate_hash(), sha256_hex("7abc42hello94"));
    }

    #[test]
    fn block_hash_consistency() {
        let block = sample_block();
        assert_eq!(block.calculate_hash(), block.calculate_hash());
        assert_eq!(block.calculate_hash(), block.clone().calculate_hash());
    }

    #[test]
    fn block_hash_changes_with_each_field() {
        let base = sample_block();
        let h = base.calculate_hash();

        let mut b = base.clone();
        b.seal = Seal::ProofOfWork { nonce: 1 };
        assert_ne!(b.calculate_hash(), h);

        let mut b = base.clone();
        b.index += 1;
        assert_ne!(b.calculate_hash(), h);

        let mut b = base.clone();
        b.previous_hash.replace_range(0..1, "1");
        assert_ne!(b.calculate_hash(), h);

        let mut b = base.clone();
        b.difficulty += 1;
        assert_ne!(b.calculate_hash(), h);

        let mut b = base.clone();
        if let Payload::Transactions(txs) = &mut b.payload {
            txs[0].amount = 10.5;
        }
        assert_ne!(b.calculate_hash(), h);
    }

    #[test]
    fn status_is_not_part_of_the_hash() {
        let base = sample_block();
        let mut b = base.clone();
        b.status = BlockStatus::invalid(InvalidReason::HashMismatch, None);
        b.hash = "ff".repeat(32);
        assert_eq!(b.calculate_hash(), base.calculate_hash());
    }

    #[test]
    fn proof_of_stake_hash_uses_validator_and_zero_nonce() {
        let mut pos = sample_block();
        pos.seal = Seal::ProofOfStake {
            validator: ValidatorSet::default().validators()[0].clone(),
        };
        let mut pow = sample_block();
        pow.seal = Seal::ProofOfWork { nonce: 0 };
        assert_eq!(pos.nonce(), 0);
        assert_ne!(pos.calculate_hash(), pow.calculate_hash());
        assert_eq!(pos.calculate_hash(), pos.calculate_hash());
    }

    #[test]
    fn merkle_root_of_block() {
        let block = sample_block();
        let leaves: Vec<String> = block.transactions().iter().map(Transaction::leaf).collect();
        let expected = sha256_hex(format!("{}{}", sha256_hex(&leaves[0]), sha256_hex(&leaves[1])));
        assert_eq!(block.merkle_root(), Some(expected));

        let empty = Block::with_transactions(0, vec![], "0".into(), 0);
        assert_eq!(empty.merkle_root(), None);
        let data = Block::with_data(0, "x", "0".into(), 0);
        assert_eq!(data.merkle_root(), None);
    }

    #[test]
    fn block_serialization_roundtrip_keeps_seal() {
        let mut block = sample_block();
        block.seal = Seal::ProofOfStake {
            validator: ValidatorSet::default().validators()[1].clone(),
        };
        block.hash = block.calculate_hash();
        let json = serde_json::to_string(&block).unwrap();
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
        assert_eq!(back.calculate_hash(), block.hash);
    }

    #[test]
    fn invalid_reason_messages() {
        assert_eq!(
            InvalidReason::HashMismatch.to_string(),
            "Data tampered: hash mismatch"
        );
        assert_eq!(
            InvalidReason::InsufficientWork { difficulty: 3 }.to_string(),
            "Invalid PoW: hash doesn't start with 3 zeros"
        );
    }
}
