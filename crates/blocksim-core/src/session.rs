//! Explicitly owned simulation state and its persisted form.
//!
//! A [`Session`] serializes to one flat JSON object. Loading merges a stored
//! object over the live one key by key, so a partial or older snapshot only
//! replaces the keys it carries.

use crate::chain::{Blockchain, ChainConfig};
use crate::race::{Leaderboard, MiningRace, RaceAgent, RaceResult};
use crate::SimError;
use anyhow::{anyhow, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Single-key blob store the session persists into.
/// Implementations live outside the engine.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Option<Value>>;
    fn save(&self, state: &Value) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// In-process store, handy for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: Mutex<Option<Value>>,
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<Value>> {
        let slot = self.slot.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        Ok(slot.clone())
    }

    fn save(&self, state: &Value) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        *slot = Some(state.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        *slot = None;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub blockchain: Blockchain,
    #[serde(default)]
    pub leaderboard: Leaderboard,
}

impl Session {
    pub fn new<R: Rng + ?Sized>(config: ChainConfig, rng: &mut R) -> Result<Self, SimError> {
        Ok(Self {
            blockchain: Blockchain::new(config)?,
            leaderboard: Leaderboard::generate(rng),
        })
    }

    pub fn snapshot(&self) -> Result<Value, SimError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Overwrite top-level keys of the live state with those in `incoming`,
    /// then revalidate the chain. On error the session is left unchanged.
    pub fn merge_snapshot(&mut self, incoming: Value) -> Result<(), SimError> {
        let Value::Object(incoming) = incoming else {
            return Err(SimError::Snapshot("expected a JSON object".into()));
        };
        let Value::Object(mut merged) = self.snapshot()? else {
            return Err(SimError::Snapshot("live state is not a JSON object".into()));
        };
        let keys = incoming.len();
        merged.extend(incoming);

        let mut next: Session = serde_json::from_value(Value::Object(merged))?;
        if next.blockchain.is_empty() {
            return Err(SimError::Snapshot("chain has no genesis block".into()));
        }
        next.blockchain = next
            .blockchain
            .with_validators(self.blockchain.validators().clone());
        next.blockchain.validate_chain();
        debug!(keys, blocks = next.blockchain.len(), "snapshot merged");
        *self = next;
        Ok(())
    }

    pub fn save_to(&self, store: &dyn StateStore) -> Result<()> {
        store.save(&self.snapshot()?)
    }

    /// Returns false when the store holds nothing yet.
    pub fn restore_from(&mut self, store: &dyn StateStore) -> Result<bool> {
        match store.load()? {
            Some(state) => {
                self.merge_snapshot(state)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clear the stored state and start over with the same chain settings.
    pub fn reset<R: Rng + ?Sized>(&mut self, store: &dyn StateStore, rng: &mut R) -> Result<()> {
        store.clear()?;
        *self = Session::new(self.blockchain.config(), rng)?;
        info!("session reset");
        Ok(())
    }

    /// Race the user against the leaderboard bots at the chain's current
    /// difficulty and record the result.
    pub fn race<R, F>(
        &mut self,
        user_hash_rate: u32,
        tick: Duration,
        rng: &mut R,
        on_progress: F,
    ) -> Result<RaceResult, SimError>
    where
        R: Rng + ?Sized,
        F: FnMut(&[RaceAgent]),
    {
        let race = MiningRace::against_leaderboard(
            &self.leaderboard,
            user_hash_rate,
            self.blockchain.difficulty(),
            rng,
        )?;
        let result = race.run(tick, on_progress);
        self.leaderboard.record(&result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ValidityPolicy;
    use crate::constants::RACE_TICK;
    use crate::race::USER_ID;
    use crate::{ConsensusType, InvalidReason};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn session() -> Session {
        let mut rng = StdRng::seed_from_u64(12);
        let mut s = Session::new(
            ChainConfig {
                difficulty: 1,
                consensus: ConsensusType::ProofOfWork,
                policy: ValidityPolicy::LocalOnly,
            },
            &mut rng,
        )
        .unwrap();
        s.blockchain.add_transaction("Alice", "Bob", 5.0).unwrap();
        s
    }

    #[test]
    fn snapshot_is_a_flat_object() {
        let snap = session().snapshot().unwrap();
        let obj = snap.as_object().unwrap();
        for key in ["chain", "mempool", "difficulty", "consensus", "policy", "leaderboard"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn save_and_restore_through_a_store() {
        let store = MemoryStore::default();
        let original = session();
        original.save_to(&store).unwrap();

        let mut rng = StdRng::seed_from_u64(99);
        let mut fresh = Session::new(ChainConfig::default(), &mut rng).unwrap();
        assert!(fresh.restore_from(&store).unwrap());
        assert_eq!(fresh, original);
    }

    #[test]
    fn empty_store_restores_nothing() {
        let store = MemoryStore::default();
        let mut s = session();
        let before = s.clone();
        assert!(!s.restore_from(&store).unwrap());
        assert_eq!(s, before);
    }

    #[test]
    fn merge_overwrites_only_given_keys() {
        let mut s = session();
        let chain_before = s.blockchain.chain().to_vec();
        s.merge_snapshot(json!({ "difficulty": 5 })).unwrap();
        assert_eq!(s.blockchain.difficulty(), 5);
        assert_eq!(s.blockchain.chain(), chain_before.as_slice());
        assert_eq!(s.blockchain.mempool().len(), 1);
    }

    #[test]
    fn merge_rejects_bad_input_without_mutation() {
        let mut s = session();
        let before = s.clone();
        assert!(matches!(
            s.merge_snapshot(json!([1, 2, 3])),
            Err(SimError::Snapshot(_))
        ));
        assert!(matches!(
            s.merge_snapshot(json!({ "chain": [] })),
            Err(SimError::Snapshot(_))
        ));
        assert!(matches!(
            s.merge_snapshot(json!({ "difficulty": "hard" })),
            Err(SimError::Json(_))
        ));
        assert_eq!(s, before);
    }

    #[test]
    fn merge_revalidates_loaded_chain() {
        let mut s = session();
        let mut block = s.blockchain.candidate_block();
        crate::mine::mine_block(&mut block, None, |_| {});
        s.blockchain.add_block(block);

        let mut snap = s.snapshot().unwrap();
        snap["chain"][1]["payload"]["value"][0]["amount"] = json!(1000.0);
        s.merge_snapshot(snap).unwrap();
        assert_eq!(
            s.blockchain.chain()[1].status.invalid_reason,
            Some(InvalidReason::HashMismatch)
        );
    }

    #[test]
    fn tampered_amounts_survive_a_store_roundtrip() {
        let store = MemoryStore::default();
        let mut s = session();
        let mut block = s.blockchain.candidate_block();
        crate::mine::mine_block(&mut block, None, |_| {});
        s.blockchain.add_block(block);

        for value in ["NaN", "inf"] {
            assert!(matches!(
                s.blockchain
                    .tamper_block_transaction(1, 0, crate::TxField::Amount, value),
                Err(SimError::InvalidFieldValue { .. })
            ));
        }
        s.blockchain
            .tamper_block_transaction(1, 0, crate::TxField::Amount, "-3")
            .unwrap();
        s.save_to(&store).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut fresh = Session::new(ChainConfig::default(), &mut rng).unwrap();
        assert!(fresh.restore_from(&store).unwrap());
        assert_eq!(fresh.blockchain.len(), 2);
        assert_eq!(fresh.blockchain.chain()[1].transactions()[0].amount, -3.0);
        assert_eq!(
            fresh.blockchain.chain()[1].status.invalid_reason,
            Some(InvalidReason::HashMismatch)
        );
    }

    #[test]
    fn reset_clears_store_and_chain() {
        let store = MemoryStore::default();
        let mut s = session();
        s.save_to(&store).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        s.reset(&store, &mut rng).unwrap();
        assert!(store.load().unwrap().is_none());
        assert_eq!(s.blockchain.len(), 1);
        assert!(s.blockchain.mempool().is_empty());
        assert_eq!(s.blockchain.difficulty(), 1);
    }

    #[test]
    fn race_updates_leaderboard() {
        let mut s = session();
        let mut rng = StdRng::seed_from_u64(31);
        let bots = s.leaderboard.miners().len();
        let result = s.race(50, RACE_TICK, &mut rng, |_| {}).unwrap();
        assert_eq!(result.agents.len(), bots + 1);
        assert_eq!(s.leaderboard.miners().len(), bots + 1);
        let user = s
            .leaderboard
            .miners()
            .iter()
            .find(|m| m.id == USER_ID)
            .unwrap();
        assert_eq!(user.races, 1);
    }
}
