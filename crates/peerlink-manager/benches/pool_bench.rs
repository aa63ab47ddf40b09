// Criterion benchmarks for peerlink-manager
//
// Run benchmarks with:
//   cargo bench -p peerlink-manager
//
// For detailed output with plots:
//   cargo bench -p peerlink-manager -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use peerlink_common::{ClientId, PeerAddress};
use peerlink_manager::{PeerPool, PoolManager};

fn peers(count: u16) -> Vec<PeerAddress> {
    (0..count).map(|i| PeerAddress::new("10.0.0.1", 9000 + i)).collect()
}

fn bench_pool_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_creation");

    for count in [2u16, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let list = peers(count);
            b.iter(|| PeerPool::new(black_box(list.clone())));
        });
    }

    group.finish();
}

fn bench_allocate_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_all");

    for count in [2u16, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let list = peers(count);
            b.iter(|| {
                let mut pool = PeerPool::new(list.clone());
                for raw in 0..u64::from(count) {
                    black_box(pool.allocate(ClientId::from_raw(raw)));
                }
            });
        });
    }

    group.finish();
}

fn bench_add_remove_peer(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_remove_peer");

    group.bench_function("add_peer", |b| {
        let list = peers(10);
        b.iter(|| {
            let mut pool = PeerPool::new(list.clone());
            pool.add_peer(PeerAddress::new("10.0.0.2", 9000));
        });
    });

    group.bench_function("add_duplicate_peer", |b| {
        let mut pool = PeerPool::new(peers(10));
        let dup = PeerAddress::new("10.0.0.1", 9005);
        b.iter(|| pool.add_peer(black_box(dup.clone())));
    });

    group.bench_function("remove_peer", |b| {
        let list = peers(10);
        let target = PeerAddress::new("10.0.0.1", 9005);
        b.iter(|| {
            let mut pool = PeerPool::new(list.clone());
            pool.remove_peer(black_box(&target));
        });
    });

    group.finish();
}

fn bench_manager_allocate_release(c: &mut Criterion) {
    let manager = PoolManager::with_peers(peers(1));
    let client = ClientId::from_raw(1);

    c.bench_function("manager_allocate_release", |b| {
        b.iter(|| {
            let peer = manager.allocate(client).ok();
            manager.release(client);
            if let Some(peer) = peer {
                manager.add(peer);
            }
        });
    });
}

criterion_group!(
    benches,
    bench_pool_creation,
    bench_allocate_all,
    bench_add_remove_peer,
    bench_manager_allocate_release
);
criterion_main!(benches);
