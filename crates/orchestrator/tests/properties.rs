//! Property tests of the decomposition, the buffer registry and the barrier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use kernel::devmap::make_hash;
use kernel::{BufferKind, BufferList, BufferSet, CellType, DeviceMap, SegmentTable, Side, Topology};
use orchestrator::decomposition::{compact_by_key, device_keys, sort_particles_by_device};
use orchestrator::sync::Synchronizer;
use proptest::prelude::*;

const CELLS: usize = 64;

fn host_with_hashes(cells: &[u32]) -> BufferList {
    let mut host = BufferList::host();
    host.add_set(BufferSet::DUMP);
    host.allocate(cells.len(), 1);
    {
        let hashes = host.get_mut::<u64>(BufferKind::Hash, Side::Read).unwrap();
        for (h, &cell) in hashes.iter_mut().zip(cells) {
            *h = make_hash(CellType::Inner, cell);
        }
    }
    {
        let ids = host.get_mut::<kernel::ParticleInfo>(BufferKind::Info, Side::Read).unwrap();
        for (i, info) in ids.iter_mut().enumerate() {
            *info = kernel::ParticleInfo::fluid(i as u32);
        }
    }
    host
}

fn cell_type() -> impl Strategy<Value = CellType> {
    prop_oneof![
        Just(CellType::Inner),
        Just(CellType::InnerEdge),
        Just(CellType::OuterEdge),
        Just(CellType::Outer),
    ]
}

proptest! {
    #[test]
    fn partition_conserves_particles(
        owners in prop::collection::vec(0u16..4, CELLS),
        cells in prop::collection::vec(0u32..CELLS as u32, 0..300),
        nodes in 1usize..3,
    ) {
        let devices_per_node = 4 / nodes;
        let topology = Topology::new(nodes, devices_per_node);
        let map = DeviceMap::from_owners(owners.clone());

        for rank in 0..nodes {
            let mut host = host_with_hashes(&cells);
            let (partition, report) =
                sort_particles_by_device(&mut host, cells.len(), &map, &topology, rank).unwrap();
            prop_assert!(report.is_ok());
            prop_assert_eq!(partition.total(), cells.len());

            let keys = device_keys(&host, cells.len(), &map).unwrap();
            for device in 0..devices_per_node {
                let global = rank * devices_per_node + device;
                let expected = cells.iter().filter(|&&c| owners[c as usize] as usize == global).count();
                let range = partition.range(device);
                prop_assert_eq!(range.len(), expected);
                prop_assert!(keys[range].iter().all(|&k| k == global));
            }

            // every id survives exactly once
            let mut ids: Vec<u32> = host
                .get::<kernel::ParticleInfo>(BufferKind::Info, Side::Read)
                .unwrap()
                .iter()
                .map(|info| info.id)
                .collect();
            ids.sort_unstable();
            prop_assert_eq!(ids, (0..cells.len() as u32).collect::<Vec<_>>());
        }
    }

    #[test]
    fn compacting_sorted_keys_is_a_no_op(keys in prop::collection::vec(0usize..5, 0..200)) {
        let mut sizes = vec![0; 5];
        for &k in &keys {
            sizes[k] += 1;
        }
        let mut once = keys.clone();
        compact_by_key(&mut once, &sizes, |_, _| {});
        prop_assert!(once.windows(2).all(|w| w[0] <= w[1]));

        let mut twice = once.clone();
        let swaps = compact_by_key(&mut twice, &sizes, |_, _| {});
        prop_assert_eq!(swaps, 0);
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn segments_of_sorted_hashes_are_monotonic(
        entries in prop::collection::vec((cell_type(), 0u32..CELLS as u32), 0..100),
    ) {
        let mut hashes: Vec<u64> = entries.iter().map(|&(t, c)| make_hash(t, c)).collect();
        hashes.sort_unstable();
        let table = SegmentTable::from_sorted_hashes(&hashes);
        prop_assert!(table.is_monotonic(hashes.len() as u32));
        if hashes.is_empty() {
            prop_assert!(table.is_empty());
        }
    }

    #[test]
    fn swapping_twice_restores_the_roles(mask in any::<u32>(), first in any::<u32>()) {
        let mut buffers = BufferList::new();
        buffers.add_set(BufferKind::ALL.iter().copied().collect());
        buffers.allocate(4, 2);
        let pick = |bits: u32| -> BufferSet {
            BufferKind::ALL.iter().copied().filter(|k| bits & k.bit() != 0).collect()
        };

        // arbitrary starting roles
        buffers.swap(pick(first));
        let before: Vec<_> = BufferKind::ALL.iter().map(|&k| buffers.read_index(k)).collect();

        buffers.swap(pick(mask));
        for (i, &kind) in BufferKind::ALL.iter().enumerate() {
            let flipped = buffers.read_index(kind) != before[i];
            let expected = pick(mask).contains(kind) && buffers.is_double_buffered(kind);
            prop_assert_eq!(flipped, expected, "{:?}", kind);
        }

        buffers.swap(pick(mask));
        let after: Vec<_> = BufferKind::ALL.iter().map(|&k| buffers.read_index(k)).collect();
        prop_assert_eq!(after, before);
    }
}

#[test]
fn barrier_rounds_never_overlap() {
    const PARTIES: usize = 5;
    const ROUNDS: usize = 200;
    let sync = Arc::new(Synchronizer::new(PARTIES));
    let entered = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..PARTIES)
        .map(|_| {
            let sync = Arc::clone(&sync);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    entered.fetch_add(1, Ordering::SeqCst);
                    sync.barrier();
                    // nobody leaves round k before all entered it
                    assert!(entered.load(Ordering::SeqCst) >= (round + 1) * PARTIES);
                    sync.barrier();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(entered.load(Ordering::SeqCst), PARTIES * ROUNDS);
}

#[test]
fn forced_unlock_releases_current_and_future_waiters() {
    let sync = Arc::new(Synchronizer::new(3));
    let waiter = {
        let sync = Arc::clone(&sync);
        thread::spawn(move || sync.barrier())
    };
    // only one of three parties ever arrives
    sync.force_unlock();
    waiter.join().unwrap();
    sync.barrier();
    sync.barrier();
    assert!(sync.is_forced_unlocked());
}
