use std::fs;

use blocksim_core::{ChainConfig, Session};
use blocksim_storage::{SledStore, StateStore};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::{tempdir, TempDir};

pub fn create_temp_store() -> (TempDir, SledStore) {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let db_path = temp_dir.path().to_path_buf();
    (
        temp_dir,
        SledStore::open(&db_path).expect("Failed to open SledStore"),
    )
}

pub fn teardown_store(temp_dir: TempDir, store: SledStore) {
    let db_path = temp_dir.path().to_path_buf();
    store.clear().expect("Failed to clear the store");
    drop(store);
    temp_dir.close().expect("Failed to delete temp dir");
    let _ = fs::remove_dir_all(&db_path);
    assert!(!db_path.exists(), "Database directory should be removed");
}

/// A low-difficulty session with a couple of pending transactions.
pub fn sample_session(seed: u64) -> Session {
    let mut rng = StdRng::seed_from_u64(seed);
    let config = ChainConfig {
        difficulty: 1,
        ..ChainConfig::default()
    };
    let mut session = Session::new(config, &mut rng).expect("genesis");
    session
        .blockchain
        .add_transaction("Alice", "Bob", 12.5)
        .expect("valid tx");
    session
        .blockchain
        .generate_transaction(&mut rng)
        .expect("valid tx");
    session
}
