//! Multi-agent mining race.
//!
//! Each contender's finishing time is drawn up front from an exponential
//! distribution whose mean is `difficulty * DIFFICULTY_SCALE / hash_rate`
//! seconds, so a contender with twice the hash rate finishes first twice as
//! often in the long run. The race is then replayed in simulated time, one
//! tick at a time, so callers can watch attempts accumulate.

use crate::constants::{
    BLOCK_REWARD, DIFFICULTY_SCALE, MAX_BOTS, MAX_RACE_TICKS, MIN_BOTS, RACE_TICK,
};
use crate::SimError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;
use tracing::info;

const BOT_NAMES: [&str; 8] = [
    "Alice", "Bob", "Charlie", "Dave", "Eve", "Frank", "Grace", "Heidi",
];
pub const USER_ID: &str = "user";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinerStatus {
    Idle,
    Racing,
    Won,
    Lost,
}

/// Persistent record of one miner across races.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinerProfile {
    pub id: String,
    pub name: String,
    /// Hashes per simulated second.
    pub hash_rate: u32,
    pub blocks_won: u64,
    pub total_rewards: u64,
    pub races: u64,
    pub is_user: bool,
}

impl MinerProfile {
    /// Percentage of entered races won.
    pub fn win_rate(&self) -> f64 {
        if self.races == 0 {
            0.0
        } else {
            self.blocks_won as f64 * 100.0 / self.races as f64
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Leaderboard {
    miners: Vec<MinerProfile>,
}

impl Leaderboard {
    /// Between five and eight bots with hash rates in 20..80.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let count = rng.gen_range(MIN_BOTS..=MAX_BOTS);
        let miners = BOT_NAMES
            .iter()
            .take(count)
            .enumerate()
            .map(|(i, name)| MinerProfile {
                id: format!("bot-{i}"),
                name: format!("Miner {name}"),
                hash_rate: 20 + rng.gen_range(0..60),
                blocks_won: 0,
                total_rewards: 0,
                races: 0,
                is_user: false,
            })
            .collect();
        Self { miners }
    }

    pub fn with_miners(miners: Vec<MinerProfile>) -> Self {
        Self { miners }
    }

    pub fn miners(&self) -> &[MinerProfile] {
        &self.miners
    }

    pub fn bots(&self) -> impl Iterator<Item = &MinerProfile> {
        self.miners.iter().filter(|m| !m.is_user)
    }

    /// Most wins first, then most rewards, then best win rate.
    pub fn ranked(&self) -> Vec<&MinerProfile> {
        let mut ranked: Vec<&MinerProfile> = self.miners.iter().collect();
        ranked.sort_by(|a, b| {
            b.blocks_won
                .cmp(&a.blocks_won)
                .then(b.total_rewards.cmp(&a.total_rewards))
                .then(
                    b.win_rate()
                        .partial_cmp(&a.win_rate())
                        .unwrap_or(Ordering::Equal),
                )
        });
        ranked
    }

    /// Fold a finished race into the standings. Contenders without a
    /// profile yet (the user, on their first race) get one.
    pub fn record(&mut self, result: &RaceResult) {
        for agent in &result.agents {
            let idx = match self.miners.iter().position(|m| m.id == agent.id) {
                Some(idx) => idx,
                None => {
                    self.miners.push(MinerProfile {
                        id: agent.id.clone(),
                        name: agent.name.clone(),
                        hash_rate: agent.hash_rate,
                        blocks_won: 0,
                        total_rewards: 0,
                        races: 0,
                        is_user: agent.is_user,
                    });
                    self.miners.len() - 1
                }
            };
            let profile = &mut self.miners[idx];
            profile.races += 1;
            if agent.status == MinerStatus::Won {
                profile.blocks_won += 1;
                profile.total_rewards += result.reward;
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contender {
    pub id: String,
    pub name: String,
    pub hash_rate: u32,
    pub is_user: bool,
}

impl From<&MinerProfile> for Contender {
    fn from(p: &MinerProfile) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            hash_rate: p.hash_rate,
            is_user: p.is_user,
        }
    }
}

/// Live state of one contender during a race.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaceAgent {
    pub id: String,
    pub name: String,
    pub hash_rate: u32,
    pub attempts: u64,
    pub elapsed: Duration,
    pub status: MinerStatus,
    pub is_user: bool,
    finish: Duration,
}

impl RaceAgent {
    fn advance_to(&mut self, clock: Duration) {
        self.elapsed = clock;
        self.attempts = (clock.as_secs_f64() * f64::from(self.hash_rate)).floor() as u64;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaceResult {
    pub winner: RaceAgent,
    pub agents: Vec<RaceAgent>,
    pub winning_time: Duration,
    pub reward: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RaceStep {
    Racing,
    Finished(RaceResult),
}

#[derive(Clone, Debug)]
pub struct MiningRace {
    agents: Vec<RaceAgent>,
    winner: usize,
    winning_time: Duration,
    clock: Duration,
    finished: bool,
}

fn finish_time<R: Rng + ?Sized>(difficulty: u32, hash_rate: u32, rng: &mut R) -> Duration {
    // 1 - U lies in (0, 1], keeping the logarithm finite.
    let draw = -(1.0 - rng.gen::<f64>()).ln();
    let mean = f64::from(difficulty) * DIFFICULTY_SCALE / f64::from(hash_rate.max(1));
    Duration::try_from_secs_f64((draw * mean).max(0.0)).unwrap_or(Duration::MAX)
}

impl MiningRace {
    pub fn new<R: Rng + ?Sized>(
        difficulty: u32,
        contenders: Vec<Contender>,
        rng: &mut R,
    ) -> Result<Self, SimError> {
        if contenders.is_empty() {
            return Err(SimError::NoContenders);
        }
        let agents: Vec<RaceAgent> = contenders
            .into_iter()
            .map(|c| RaceAgent {
                finish: finish_time(difficulty, c.hash_rate, rng),
                id: c.id,
                name: c.name,
                hash_rate: c.hash_rate,
                attempts: 0,
                elapsed: Duration::ZERO,
                status: MinerStatus::Racing,
                is_user: c.is_user,
            })
            .collect();
        let (winner, winning_time) = agents
            .iter()
            .enumerate()
            .min_by_key(|(_, a)| a.finish)
            .map(|(i, a)| (i, a.finish))
            .ok_or(SimError::NoContenders)?;
        Ok(Self {
            agents,
            winner,
            winning_time,
            clock: Duration::ZERO,
            finished: false,
        })
    }

    /// The user at `user_hash_rate` against every bot on the leaderboard.
    pub fn against_leaderboard<R: Rng + ?Sized>(
        leaderboard: &Leaderboard,
        user_hash_rate: u32,
        difficulty: u32,
        rng: &mut R,
    ) -> Result<Self, SimError> {
        let user_name = leaderboard
            .miners()
            .iter()
            .find(|m| m.id == USER_ID)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| "You".to_string());
        let mut contenders = vec![Contender {
            id: USER_ID.to_string(),
            name: user_name,
            hash_rate: user_hash_rate,
            is_user: true,
        }];
        contenders.extend(leaderboard.bots().map(Contender::from));
        Self::new(difficulty, contenders, rng)
    }

    pub fn agents(&self) -> &[RaceAgent] {
        &self.agents
    }

    pub fn clock(&self) -> Duration {
        self.clock
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn result(&self) -> RaceResult {
        RaceResult {
            winner: self.agents[self.winner].clone(),
            agents: self.agents.clone(),
            winning_time: self.winning_time,
            reward: BLOCK_REWARD,
        }
    }

    /// Advance simulated time by `dt`. Attempts grow with each agent's hash
    /// rate until the winning time is reached, at which point every agent is
    /// frozen there and marked won or lost.
    pub fn tick(&mut self, dt: Duration) -> RaceStep {
        if self.finished {
            return RaceStep::Finished(self.result());
        }
        self.clock = self.clock.saturating_add(dt);
        if self.clock < self.winning_time {
            let clock = self.clock;
            self.agents.iter_mut().for_each(|a| a.advance_to(clock));
            return RaceStep::Racing;
        }

        self.clock = self.winning_time;
        self.finished = true;
        let (winner, winning_time) = (self.winner, self.winning_time);
        for (i, agent) in self.agents.iter_mut().enumerate() {
            agent.advance_to(winning_time);
            agent.status = if i == winner {
                MinerStatus::Won
            } else {
                MinerStatus::Lost
            };
        }
        let result = self.result();
        info!(
            winner = %result.winner.name,
            secs = winning_time.as_secs_f64(),
            "mining race finished"
        );
        RaceStep::Finished(result)
    }

    /// Tick until finished, handing the agents to `on_progress` after every
    /// tick. A zero `dt` falls back to [`RACE_TICK`], and `dt` is widened so
    /// the replay takes at most [`MAX_RACE_TICKS`] + 1 ticks.
    pub fn run<F: FnMut(&[RaceAgent])>(mut self, dt: Duration, mut on_progress: F) -> RaceResult {
        let dt = if dt.is_zero() { RACE_TICK } else { dt };
        let dt = dt.max(self.winning_time / MAX_RACE_TICKS);
        loop {
            let step = self.tick(dt);
            on_progress(&self.agents);
            if let RaceStep::Finished(result) = step {
                return result;
            }
        }
    }
}
