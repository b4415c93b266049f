use blocksim_core::merkle::build_merkle_tree;
use blocksim_core::mine::mine_block;
use blocksim_core::{Block, Transaction};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn sample_txs(n: usize) -> Vec<Transaction> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n)
        .map(|i| Transaction {
            id: format!("tx-{i}"),
            sender: format!("alice-{i}"),
            receiver: "bob".into(),
            amount: f64::from(rng.gen_range(1u32..100)),
            timestamp: 1_600_000_000_000 + i as u64,
        })
        .collect()
}

fn bench_pow(c: &mut Criterion) {
    let mut group = c.benchmark_group("mine_block");
    let mut block = Block::with_transactions(1, sample_txs(10), "0".repeat(64), 0);
    block.timestamp = 1_600_000_000_000;
    for difficulty in [1u32, 2, 3] {
        block.difficulty = difficulty;
        group.bench_with_input(BenchmarkId::from_parameter(difficulty), &block, |b, block| {
            b.iter(|| {
                let mut candidate = block.clone();
                mine_block(&mut candidate, None, |_| {})
            });
        });
    }
    group.finish();
}

fn bench_merkle(c: &mut Criterion) {
    let leaves: Vec<String> = sample_txs(1_000).iter().map(Transaction::leaf).collect();
    c.bench_function("merkle_tree_1000_leaves", |b| {
        b.iter(|| build_merkle_tree(&leaves))
    });
}

criterion_group!(benches, bench_pow, bench_merkle);
criterion_main!(benches);
