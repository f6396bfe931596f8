//! Chunker and tree builder benchmarks

use cairn_core::config::SplitConfig;
use cairn_core::hashsplit::{split_to_blob_or_tree, HashSplitter};
use cairn_core::object::hash_object;
use cairn_core::{MemStore, ObjectKind};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(0xCA1F);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

fn bench_split(c: &mut Criterion) {
    let data = random_bytes(8 << 20);
    let config = SplitConfig::default();

    let mut group = c.benchmark_group("hashsplit");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("chunk_8mib", |b| {
        b.iter(|| {
            let n = HashSplitter::single(black_box(data.as_slice()), &config)
                .unwrap()
                .map(|c| c.map(|c| c.data.len()).unwrap_or(0))
                .count();
            black_box(n)
        });
    });
    group.bench_function("split_to_tree_8mib", |b| {
        b.iter(|| {
            let mut store = MemStore::new();
            black_box(split_to_blob_or_tree(&mut store, vec![data.as_slice()], &config).ok())
        });
    });
    group.finish();
}

fn bench_hash_object(c: &mut Criterion) {
    let data = random_bytes(8192);
    c.bench_function("hash_object_8k", |b| {
        b.iter(|| black_box(hash_object(ObjectKind::Blob, black_box(&data))));
    });
}

criterion_group!(benches, bench_split, bench_hash_object);
criterion_main!(benches);
