//! Proof-of-Work target checks and Proof-of-Stake validator selection.

use crate::{Block, Seal, SimError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusType {
    #[default]
    ProofOfWork,
    ProofOfStake,
}

impl fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusType::ProofOfWork => write!(f, "pow"),
            ConsensusType::ProofOfStake => write!(f, "pos"),
        }
    }
}

impl FromStr for ConsensusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pow" | "proof-of-work" => Ok(Self::ProofOfWork),
            "pos" | "proof-of-stake" => Ok(Self::ProofOfStake),
            other => Err(format!("unknown consensus type `{other}` (expected pow or pos)")),
        }
    }
}

/// Number of leading `'0'` characters of a hex digest.
pub fn leading_hex_zeros(hash: &str) -> u32 {
    hash.bytes().take_while(|b| *b == b'0').count() as u32
}

/// True iff the first `difficulty` characters of `hash` are all `'0'`.
pub fn is_hash_valid(hash: &str, difficulty: u32) -> bool {
    leading_hex_zeros(hash) >= difficulty
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub name: String,
    pub stake: u64,
    /// Display colour, carried for front-ends.
    pub color: String,
}

impl Validator {
    pub fn new(name: impl Into<String>, stake: u64, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stake,
            color: color.into(),
        }
    }
}

/// A fixed set of stake-weighted participants. Serialized as a plain list;
/// deserializing goes through [`ValidatorSet::new`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Validator>", into = "Vec<Validator>")]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl TryFrom<Vec<Validator>> for ValidatorSet {
    type Error = SimError;

    fn try_from(validators: Vec<Validator>) -> Result<Self, Self::Error> {
        Self::new(validators)
    }
}

impl From<ValidatorSet> for Vec<Validator> {
    fn from(set: ValidatorSet) -> Self {
        set.validators
    }
}

impl Default for ValidatorSet {
    fn default() -> Self {
        Self {
            validators: vec![
                Validator::new("Alice", 50, "#e91e63"),
                Validator::new("Bob", 30, "#3f51b5"),
                Validator::new("Carol", 20, "#009688"),
            ],
        }
    }
}

impl ValidatorSet {
    /// Validators with zero stake are dropped; at least one must remain.
    pub fn new(validators: Vec<Validator>) -> Result<Self, SimError> {
        let validators: Vec<Validator> = validators.into_iter().filter(|v| v.stake > 0).collect();
        if validators.is_empty() {
            return Err(SimError::EmptyValidatorSet);
        }
        Ok(Self { validators })
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn total_stake(&self) -> u64 {
        self.validators.iter().map(|v| v.stake).sum()
    }

    /// Selection probability of each validator, `stake / total_stake`.
    pub fn probabilities(&self) -> Vec<(&str, f64)> {
        let total = self.total_stake() as f64;
        self.validators
            .iter()
            .map(|v| (v.name.as_str(), v.stake as f64 / total))
            .collect()
    }

    /// Weighted sampling: each validator is picked with probability
    /// proportional to its stake. Pass a seeded RNG to pin the outcome.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> &Validator {
        let mut ticket = rng.gen_range(0..self.total_stake());
        for v in &self.validators {
            if ticket < v.stake {
                return v;
            }
            ticket -= v.stake;
        }
        // Unreachable while the ticket is drawn below the total stake.
        &self.validators[self.validators.len() - 1]
    }
}

/// Seal `block` under Proof-of-Stake: pick a validator, fix the nonce at
/// zero and store the resulting hash. Returns the chosen validator.
pub fn validate_block_pos<'a, R: Rng + ?Sized>(
    block: &mut Block,
    validators: &'a ValidatorSet,
    rng: &mut R,
) -> &'a Validator {
    let validator = validators.select(rng);
    block.seal = Seal::ProofOfStake {
        validator: validator.clone(),
    };
    block.hash = block.calculate_hash();
    debug!(index = block.index, validator = %validator.name, "block validated by stake");
    validator
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn leading_zero_examples() {
        assert_eq!(leading_hex_zeros("000abc"), 3);
        assert_eq!(leading_hex_zeros("abc000"), 0);
        assert_eq!(leading_hex_zeros(""), 0);
        assert!(is_hash_valid("00ff", 2));
        assert!(is_hash_valid("00ff", 1));
        assert!(!is_hash_valid("00ff", 3));
        assert!(is_hash_valid("ffff", 0));
        assert!(!is_hash_valid("00", 3));
    }

    #[test]
    fn consensus_type_parsing() {
        assert_eq!("pow".parse::<ConsensusType>(), Ok(ConsensusType::ProofOfWork));
        assert_eq!("PoS".parse::<ConsensusType>(), Ok(ConsensusType::ProofOfStake));
        assert!("dpos".parse::<ConsensusType>().is_err());
        assert_eq!(ConsensusType::ProofOfStake.to_string(), "pos");
    }

    #[test]
    fn probabilities_follow_stake() {
        let set = ValidatorSet::default();
        assert_eq!(set.total_stake(), 100);
        let p = set.probabilities();
        assert_eq!(p[0], ("Alice", 0.5));
        assert_eq!(p[1], ("Bob", 0.3));
        assert_eq!(p[2], ("Carol", 0.2));
    }

    #[test]
    fn empty_or_zero_stake_sets_are_rejected() {
        assert!(matches!(ValidatorSet::new(vec![]), Err(SimError::EmptyValidatorSet)));
        assert!(matches!(
            ValidatorSet::new(vec![Validator::new("Zed", 0, "#000")]),
            Err(SimError::EmptyValidatorSet)
        ));
        let set = ValidatorSet::new(vec![
            Validator::new("Zed", 0, "#000"),
            Validator::new("Yan", 5, "#111"),
        ])
        .unwrap();
        assert_eq!(set.validators().len(), 1);
    }

    #[test]
    fn deserializing_enforces_a_non_empty_set() {
        assert!(serde_json::from_str::<ValidatorSet>("[]").is_err());
        assert!(serde_json::from_str::<ValidatorSet>(
            r##"[{"name":"Zed","stake":0,"color":"#000"}]"##
        )
        .is_err());
        let json = serde_json::to_string(&ValidatorSet::default()).unwrap();
        let set: ValidatorSet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, ValidatorSet::default());
        let mut rng = StdRng::seed_from_u64(3);
        assert!(set.validators().contains(set.select(&mut rng)));
    }

    #[test]
    fn seeded_selection_is_reproducible() {
        let set = ValidatorSet::default();
        let picks = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| set.select(&mut rng).name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(7), picks(7));
    }

    #[test]
    fn selection_frequency_tracks_stake() {
        let set = ValidatorSet::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0u32; 3];
        for _ in 0..10_000 {
            let v = set.select(&mut rng);
            let i = set.validators().iter().position(|x| x == v).unwrap();
            counts[i] += 1;
        }
        assert!(counts[0] > counts[1] && counts[1] > counts[2]);
        // Alice holds half the stake.
        assert!((4_500..5_500).contains(&counts[0]), "{counts:?}");
    }

    #[test]
    fn single_validator_always_selected() {
        let set = ValidatorSet::new(vec![Validator::new("Solo", 1, "#fff")]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert_eq!(set.select(&mut rng).name, "Solo");
        }
    }

    #[test]
    fn pos_seal_sets_validator_and_hash() {
        let set = ValidatorSet::default();
        let mut rng = StdRng::seed_from_u64(3);
        let mut block = Block::with_data(1, "payload", "0".repeat(64), 3);
        let chosen = validate_block_pos(&mut block, &set, &mut rng).clone();
        assert_eq!(block.validator(), Some(&chosen));
        assert_eq!(block.nonce(), 0);
        assert_eq!(block.hash, block.calculate_hash());
    }
}
