//! Thread rendezvous: the command barrier and the halo board.

use std::sync::Arc;

use kernel::HaloPacket;
use parking_lot::{Condvar, Mutex};

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BarrierState {
    waiting: usize,
    generation: u64,
    forced: bool,
}

/// Reusable N-party barrier that can be released for good.
///
/// Each call to [`Synchronizer::barrier`] blocks until `parties` threads are
/// waiting in the same round. Rounds are told apart by a generation counter,
/// so the barrier can be reused immediately. After
/// [`Synchronizer::force_unlock`] no call ever blocks again.
#[derive(Debug)]
pub struct Synchronizer {
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl Synchronizer {
    /// Barrier for `parties` threads.
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
                forced: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Number of threads each round waits for.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Wait until every party reached this round.
    pub fn barrier(&self) {
        let mut state = self.state.lock();
        if state.forced {
            return;
        }
        let generation = state.generation;
        state.waiting += 1;
        if state.waiting == self.parties {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cond.notify_all();
            return;
        }
        while state.generation == generation && !state.forced {
            self.cond.wait(&mut state);
        }
    }

    /// Release every current and future waiter.
    pub fn force_unlock(&self) {
        let mut state = self.state.lock();
        state.forced = true;
        state.waiting = 0;
        self.cond.notify_all();
    }

    /// True once [`Synchronizer::force_unlock`] ran.
    pub fn is_forced_unlocked(&self) -> bool {
        self.state.lock().forced
    }
}

// ---------------------------------------------------------------------------
// Halo board
// ---------------------------------------------------------------------------

/// Where devices leave their edge particles during a halo command.
///
/// Every device publishes one packet, waits on the peer barrier, reads all
/// packets, then waits again so that no packet is replaced while a peer is
/// still reading it. Only workers take part; the coordinator never touches
/// the peer barrier.
#[derive(Debug)]
pub struct HaloExchange {
    board: Mutex<Vec<Option<Arc<HaloPacket>>>>,
    peers: Synchronizer,
}

impl HaloExchange {
    /// Board for `total_devices` devices across the cluster.
    pub fn new(total_devices: usize) -> Self {
        Self {
            board: Mutex::new(vec![None; total_devices]),
            peers: Synchronizer::new(total_devices),
        }
    }

    /// Devices taking part in every exchange.
    pub fn devices(&self) -> usize {
        self.peers.parties()
    }

    /// Post the packet of global device `device_number`.
    pub fn publish(&self, device_number: usize, packet: Arc<HaloPacket>) {
        let mut board = self.board.lock();
        if let Some(slot) = board.get_mut(device_number) {
            *slot = Some(packet);
        }
    }

    /// Every packet currently posted, in device order.
    pub fn packets(&self) -> Vec<Arc<HaloPacket>> {
        self.board.lock().iter().flatten().cloned().collect()
    }

    /// Peer rendezvous between the two halves of an exchange.
    pub fn barrier(&self) {
        self.peers.barrier();
    }

    /// Release peers stuck in an exchange.
    pub fn force_unlock(&self) {
        self.peers.force_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn single_party_never_blocks() {
        let sync = Synchronizer::new(1);
        for _ in 0..3 {
            sync.barrier();
        }
        assert!(!sync.is_forced_unlocked());
    }

    #[test]
    fn rounds_are_reusable() {
        let sync = Arc::new(Synchronizer::new(4));
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sync = Arc::clone(&sync);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for round in 0..10 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        sync.barrier();
                        // everybody incremented before anyone passed
                        assert!(counter.load(Ordering::SeqCst) >= 4 * (round + 1));
                        sync.barrier();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn force_unlock_releases_waiters() {
        let sync = Arc::new(Synchronizer::new(3));
        let waiter = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                sync.barrier();
                sync.barrier();
            })
        };
        thread::sleep(std::time::Duration::from_millis(20));
        sync.force_unlock();
        waiter.join().unwrap();
        assert!(sync.is_forced_unlocked());
        sync.barrier();
    }

    #[test]
    fn halo_board_keeps_latest_packet() {
        let halo = HaloExchange::new(2);
        halo.publish(1, Arc::new(HaloPacket::new(1)));
        assert_eq!(halo.packets().len(), 1);
        halo.publish(0, Arc::new(HaloPacket::new(0)));
        halo.publish(1, Arc::new(HaloPacket::new(1)));
        let sources: Vec<_> = halo.packets().iter().map(|p| p.source).collect();
        assert_eq!(sources, vec![0, 1]);
        // out of range is ignored
        halo.publish(5, Arc::new(HaloPacket::new(5)));
        assert_eq!(halo.packets().len(), 2);
    }
}
