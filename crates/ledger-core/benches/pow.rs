use criterion::{criterion_group, criterion_main, Criterion};
use ledger_core::pow::mine_parallel;
use ledger_core::{Amount, Block, Transaction};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn candidate(rng: &mut StdRng) -> Block {
    let payload = Transaction::new(
        format!("payer-{}", rng.gen_range(0..1_000)),
        Amount::from_units(rng.gen_range(1..1_000_000_000)),
    );
    Block::new(Uuid::new_v4(), "00ab", payload)
}

fn bench_pow(c: &mut Criterion) {
    let cancel = CancellationToken::new();
    let mut rng = StdRng::seed_from_u64(42);

    c.bench_function("mine_difficulty_3", |b| {
        let block = candidate(&mut rng);
        b.iter(|| {
            let mut mined = block.clone();
            mined.mine(3, &cancel).unwrap();
        });
    });

    c.bench_function("mine_parallel_difficulty_3", |b| {
        let block = candidate(&mut rng);
        b.iter(|| {
            let mut mined = block.clone();
            mine_parallel(&mut mined, 3, &cancel).unwrap();
        });
    });
}

criterion_group!(benches, bench_pow);
criterion_main!(benches);
