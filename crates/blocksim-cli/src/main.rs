use anyhow::{Context, Result};
use blocksim_core::constants::{MAX_DIFFICULTY, MINING_BATCH_SIZE, MINING_TIMEOUT, RACE_TICK};
use blocksim_core::consensus::validate_block_pos;
use blocksim_core::merkle::{
    build_merkle_tree, get_merkle_proof, get_merkle_root, leaf_hash, verify_merkle_proof,
};
use blocksim_core::mine::apply_outcome;
use blocksim_core::{
    sha256_hex, Block, ConsensusType, MineOutcome, PowSearch, SearchStep, Session, TxField,
    ValidityPolicy,
};
use blocksim_storage::SledStore;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "blocksim")]
#[command(about = "Educational blockchain simulator")]
struct Cli {
    /// Data directory for sled
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// Difficulty for blocks assembled from now on (leading hex zeros)
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(0..=MAX_DIFFICULTY as i64))]
    difficulty: Option<u32>,

    /// Consensus for new blocks: pow or pos
    #[arg(long, global = true)]
    consensus: Option<ConsensusType>,

    /// Validity policy: local or cascading
    #[arg(long, global = true)]
    policy: Option<ValidityPolicy>,

    /// Seed every random draw (validator pick, generated txs, races)
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// SHA-256 of a string
    Hash { input: String },
    /// Manage the mempool
    Tx {
        #[command(subcommand)]
        cmd: TxCommand,
    },
    /// Seal a block over the pending transactions (or a data string) and append it
    Mine {
        /// Mine a single data string instead of the mempool
        #[arg(long)]
        data: Option<String>,
        /// Give up after this many seconds
        #[arg(long, default_value_t = MINING_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// Inspect the chain
    Chain {
        #[command(subcommand)]
        cmd: ChainCommand,
    },
    /// Edit an admitted block in place
    Tamper {
        #[command(subcommand)]
        cmd: TamperCommand,
    },
    /// Re-seal a block over its current contents
    Remine {
        block: usize,
        #[arg(long, default_value_t = MINING_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// Race against the bot miners
    Race {
        /// Your hash rate in hashes per simulated second
        #[arg(long, default_value_t = 50)]
        hash_rate: u32,
    },
    /// Show the leaderboard
    Leaderboard,
    /// Show validator stakes and selection odds
    Validators,
    /// Build a Merkle tree over the given leaves
    Merkle {
        #[arg(required = true)]
        leaves: Vec<String>,
        /// Print and check the inclusion proof for this leaf
        #[arg(long)]
        index: Option<usize>,
    },
    /// Forget the stored session
    Reset,
}

#[derive(Subcommand, Debug)]
enum TxCommand {
    Add {
        sender: String,
        receiver: String,
        amount: f64,
    },
    List,
    Remove {
        id: String,
    },
    /// Add random transfers between demo accounts
    Generate {
        #[arg(default_value_t = 1)]
        count: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ChainCommand {
    Show {
        /// Dump the chain as JSON
        #[arg(long)]
        json: bool,
    },
    Validate,
}

#[derive(Subcommand, Debug)]
enum TamperCommand {
    /// Overwrite a transaction field (id, sender, receiver, amount, timestamp)
    Tx {
        block: usize,
        tx: usize,
        field: TxField,
        value: String,
    },
    PrevHash {
        block: usize,
        value: String,
    },
    Data {
        block: usize,
        value: String,
    },
}

fn short(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}

/// Run the nonce search in batches, yielding to the runtime between them.
async fn mine_cooperatively(block: &Block, timeout: Duration) -> MineOutcome {
    let mut search = PowSearch::new(block).with_timeout(timeout);
    loop {
        match search.step(MINING_BATCH_SIZE) {
            SearchStep::Continue(progress) => {
                debug!(nonce = progress.nonce, hash = %progress.last_hash, "mining");
                tokio::task::yield_now().await;
            }
            SearchStep::Found {
                nonce,
                hash,
                progress,
            } => {
                return MineOutcome::Mined {
                    nonce,
                    hash,
                    attempts: progress.attempts,
                    elapsed: progress.elapsed,
                }
            }
            SearchStep::TimedOut(progress) => {
                return MineOutcome::TimedOut {
                    attempts: progress.attempts,
                    elapsed: progress.elapsed,
                }
            }
        }
    }
}

fn print_chain(session: &Session) {
    let chain = &session.blockchain;
    for block in chain.chain() {
        let seal = match block.validator() {
            Some(v) => format!("validator {}", v.name),
            None => format!("nonce {}", block.nonce()),
        };
        let status = match &block.status.invalid_reason {
            None => "valid".to_string(),
            Some(reason) => format!("INVALID ({reason})"),
        };
        println!(
            "#{} {} prev {} d{} {} txs {} conf {} {}",
            block.index,
            short(&block.hash),
            short(&block.previous_hash),
            block.difficulty,
            seal,
            block.transactions().len(),
            chain.confirmations(block.index as usize),
            status
        );
        if let Some(root) = block.merkle_root() {
            println!("    merkle root {root}");
        }
    }
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Stateless commands never touch the store.
    match &cli.cmd {
        Command::Hash { input } => {
            println!("{}", sha256_hex(input));
            return Ok(());
        }
        Command::Merkle { leaves, index } => return merkle(leaves, *index),
        _ => {}
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;
    runtime.block_on(run(cli))
}

fn merkle(leaves: &[String], index: Option<usize>) -> Result<()> {
    let tree = build_merkle_tree(leaves)?;
    let root = get_merkle_root(&tree);
    println!("root: {root}");
    if let Some(index) = index {
        let proof = get_merkle_proof(&tree, index, leaves.len())?;
        println!("{}", serde_json::to_string_pretty(&proof)?);
        let verified = verify_merkle_proof(&proof, &leaf_hash(&leaves[index]), root);
        println!("verified: {verified}");
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let store = SledStore::open(&cli.data_dir)?;

    let mut session = Session::new(Default::default(), &mut rng)?;
    // An unreadable blob starts a fresh session but is never overwritten;
    // only `reset` discards it.
    let readable = match session.restore_from(&store) {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "could not restore session, starting fresh");
            false
        }
    };
    if let Some(difficulty) = cli.difficulty {
        session.blockchain.set_difficulty(difficulty);
    }
    if let Some(consensus) = cli.consensus {
        session.blockchain.set_consensus(consensus);
    }
    if let Some(policy) = cli.policy {
        session.blockchain.set_policy(policy);
    }

    match cli.cmd {
        // Handled in main.
        Command::Hash { .. } | Command::Merkle { .. } => return Ok(()),
        Command::Tx { cmd } => match cmd {
            TxCommand::Add {
                sender,
                receiver,
                amount,
            } => {
                let tx = session.blockchain.add_transaction(&sender, &receiver, amount)?;
                println!("added {}", tx.id);
            }
            TxCommand::List => {
                for tx in session.blockchain.mempool() {
                    println!("{} {} -> {} {}", tx.id, tx.sender, tx.receiver, tx.amount);
                }
                println!("{} pending", session.blockchain.mempool().len());
            }
            TxCommand::Remove { id } => {
                if session.blockchain.remove_transaction(&id) {
                    println!("removed {id}");
                } else {
                    println!("no pending transaction {id}");
                }
            }
            TxCommand::Generate { count } => {
                for _ in 0..count {
                    let tx = session.blockchain.generate_transaction(&mut rng)?;
                    println!("added {} {} -> {} {}", tx.id, tx.sender, tx.receiver, tx.amount);
                }
            }
        },
        Command::Mine { data, timeout } => {
            let mut block = match data {
                Some(data) => session.blockchain.candidate_data_block(data),
                None => session.blockchain.candidate_block(),
            };
            match session.blockchain.consensus() {
                ConsensusType::ProofOfStake => {
                    let validators = session.blockchain.validators().clone();
                    let validator = validate_block_pos(&mut block, &validators, &mut rng);
                    println!(
                        "Block #{} validated by {} (stake {})",
                        block.index, validator.name, validator.stake
                    );
                }
                ConsensusType::ProofOfWork => {
                    let outcome = tokio::select! {
                        outcome = mine_cooperatively(&block, Duration::from_secs(timeout)) => outcome,
                        _ = tokio::signal::ctrl_c() => {
                            warn!("mining cancelled");
                            return Ok(());
                        }
                    };
                    match &outcome {
                        MineOutcome::Mined {
                            nonce,
                            attempts,
                            elapsed,
                            ..
                        } => println!(
                            "Mined block #{} with nonce {} after {} attempts in {:?}",
                            block.index, nonce, attempts, elapsed
                        ),
                        MineOutcome::TimedOut { attempts, .. } => {
                            println!(
                                "Mining timed out after {attempts} attempts; try a lower difficulty"
                            );
                            return Ok(());
                        }
                    }
                    apply_outcome(&mut block, &outcome);
                }
            }
            let admitted = session.blockchain.add_block(block);
            println!("hash {}", admitted.hash);
        }
        Command::Chain { cmd } => match cmd {
            ChainCommand::Show { json } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(session.blockchain.chain())?);
                } else {
                    print_chain(&session);
                }
            }
            ChainCommand::Validate => {
                session.blockchain.validate_chain();
                for block in session.blockchain.chain() {
                    if let Some(reason) = &block.status.invalid_reason {
                        println!("block #{}: {reason}", block.index);
                    }
                }
                if session.blockchain.is_chain_valid() {
                    println!("chain valid ({} blocks)", session.blockchain.len());
                } else {
                    println!("chain invalid");
                }
            }
        },
        Command::Tamper { cmd } => {
            let index = match cmd {
                TamperCommand::Tx {
                    block,
                    tx,
                    field,
                    value,
                } => {
                    session
                        .blockchain
                        .tamper_block_transaction(block, tx, field, &value)?;
                    block
                }
                TamperCommand::PrevHash { block, value } => {
                    session.blockchain.tamper_previous_hash(block, &value)?;
                    block
                }
                TamperCommand::Data { block, value } => {
                    session.blockchain.tamper_block_data(block, &value)?;
                    block
                }
            };
            if let Some(block) = session.blockchain.block(index) {
                match &block.status.invalid_reason {
                    Some(reason) => println!("block #{index}: {reason}"),
                    None => println!("block #{index}: still valid"),
                }
            }
        }
        Command::Remine { block, timeout } => {
            let outcome = session.blockchain.remine_block(
                block,
                Some(Duration::from_secs(timeout)),
                |p| debug!(nonce = p.nonce, "re-mining"),
            )?;
            match outcome {
                MineOutcome::Mined { nonce, hash, .. } => {
                    println!("block #{block} resealed with nonce {nonce}, hash {hash}")
                }
                MineOutcome::TimedOut { attempts, .. } => {
                    println!("re-mining timed out after {attempts} attempts")
                }
            }
        }
        Command::Race { hash_rate } => {
            let result = session.race(hash_rate, RACE_TICK, &mut rng, |_| {})?;
            for agent in &result.agents {
                println!(
                    "{:<16} {:>4} H/s {:>8} attempts {:?}",
                    agent.name, agent.hash_rate, agent.attempts, agent.status
                );
            }
            println!(
                "winner: {} after {:.2}s, reward {}",
                result.winner.name,
                result.winning_time.as_secs_f64(),
                result.reward
            );
        }
        Command::Leaderboard => {
            for (rank, miner) in session.leaderboard.ranked().iter().enumerate() {
                println!(
                    "{:>2}. {:<16} wins {:>3} rewards {:>5} win rate {:.1}%",
                    rank + 1,
                    miner.name,
                    miner.blocks_won,
                    miner.total_rewards,
                    miner.win_rate()
                );
            }
        }
        Command::Validators => {
            for (name, p) in session.blockchain.validators().probabilities() {
                println!("{name:<8} {:.0}%", p * 100.0);
            }
        }
        Command::Reset => {
            session.reset(&store, &mut rng)?;
            println!("session reset");
            return Ok(());
        }
    }

    if !readable {
        eprintln!("session not saved: stored state is unreadable (run `blocksim reset` to discard it)");
    } else if let Err(e) = session.save_to(&store) {
        warn!(error = %e, "could not save session");
    }
    if session.blockchain.len() > 1 && !session.blockchain.is_chain_valid() {
        info!("chain currently has invalid blocks");
    }
    Ok(())
}
