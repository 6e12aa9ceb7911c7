//! Startup sort of the host particles by owning device.
//!
//! Run with: cargo bench -p orchestrator --bench compaction

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use kernel::devmap::make_hash;
use kernel::{BufferKind, BufferList, BufferSet, CellType, DeviceMap, Side, Topology};
use orchestrator::decomposition::sort_particles_by_device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CELLS: u32 = 4096;
const DEVICES: usize = 4;

fn shuffled_host(n: usize) -> BufferList {
    let mut rng = StdRng::seed_from_u64(42);
    let mut host = BufferList::host();
    host.add_set(BufferSet::DUMP);
    host.allocate(n, 1);
    if let Ok(hashes) = host.get_mut::<u64>(BufferKind::Hash, Side::Read) {
        for h in hashes.iter_mut() {
            *h = make_hash(CellType::Inner, rng.gen_range(0..CELLS));
        }
    }
    host
}

fn bench_sort_by_device(c: &mut Criterion) {
    let owners = (0..CELLS).map(|cell| (cell as usize * DEVICES / CELLS as usize) as u16).collect();
    let map = DeviceMap::from_owners(owners);
    let topology = Topology::new(1, DEVICES);

    let mut group = c.benchmark_group("sort_by_device");
    for &n in &[10_000usize, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || shuffled_host(n),
                |mut host| black_box(sort_particles_by_device(&mut host, n, &map, &topology, 0)),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sort_by_device);
criterion_main!(benches);
