//! Reductions across the nodes of a run.
//!
//! Every node runs its own [`crate::Simulation`] and issues the same
//! sequence of reductions, so each call is a collective: it returns only once
//! every node contributed. [`SingleNode`] is the trivial case;
//! [`LocalCluster`] runs the nodes as threads of one process.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::sync::{HaloExchange, Synchronizer};

/// Combining operator of a numeric reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionOp {
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Sum of all values.
    Sum,
}

impl ReductionOp {
    fn fold_f64(self, a: f64, b: f64) -> f64 {
        match self {
            ReductionOp::Min => a.min(b),
            ReductionOp::Max => a.max(b),
            ReductionOp::Sum => a + b,
        }
    }

    fn fold_u64(self, a: u64, b: u64) -> u64 {
        match self {
            ReductionOp::Min => a.min(b),
            ReductionOp::Max => a.max(b),
            ReductionOp::Sum => a.saturating_add(b),
        }
    }
}

/// Collective operations between nodes.
///
/// Slices are reduced element-wise and overwritten with the result on every
/// node.
pub trait NetworkManager: Send + Sync {
    /// Index of this node.
    fn rank(&self) -> usize;

    /// Number of nodes.
    fn nodes(&self) -> usize;

    /// Logical OR of one flag per node.
    fn bool_or_reduction(&self, value: bool) -> bool;

    /// Element-wise reduction of single-precision values.
    fn float_reduction(&self, values: &mut [f32], op: ReductionOp);

    /// Element-wise reduction of double-precision values.
    fn double_reduction(&self, values: &mut [f64], op: ReductionOp);

    /// Element-wise reduction of counters.
    fn int_reduction(&self, values: &mut [u64], op: ReductionOp);

    /// One value from every node, in rank order.
    fn all_gather_u32(&self, value: u32) -> Vec<u32>;

    /// Board shared by every device of the run for halo exchanges.
    fn halo_exchange(&self, total_devices: usize) -> Arc<HaloExchange>;

    /// Release the other nodes after a fatal error on this one.
    fn abort(&self) {}

    /// True once some node aborted; collective results are then meaningless.
    fn aborted(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Single node
// ---------------------------------------------------------------------------

/// The only node of a run: every reduction is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleNode;

impl NetworkManager for SingleNode {
    fn rank(&self) -> usize {
        0
    }

    fn nodes(&self) -> usize {
        1
    }

    fn bool_or_reduction(&self, value: bool) -> bool {
        value
    }

    fn float_reduction(&self, _values: &mut [f32], _op: ReductionOp) {}

    fn double_reduction(&self, _values: &mut [f64], _op: ReductionOp) {}

    fn int_reduction(&self, _values: &mut [u64], _op: ReductionOp) {}

    fn all_gather_u32(&self, value: u32) -> Vec<u32> {
        vec![value]
    }

    fn halo_exchange(&self, total_devices: usize) -> Arc<HaloExchange> {
        Arc::new(HaloExchange::new(total_devices))
    }
}

// ---------------------------------------------------------------------------
// In-process cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Contribution {
    Empty,
    Bool(bool),
    Doubles(Vec<f64>),
    Ints(Vec<u64>),
}

#[derive(Debug)]
struct ClusterShared {
    nodes: usize,
    slots: Mutex<Vec<Contribution>>,
    sync: Synchronizer,
    halo: Mutex<Option<Arc<HaloExchange>>>,
}

/// One node of a cluster whose nodes are threads of the same process.
///
/// Each collective deposits this node's contribution, waits for the others,
/// combines all contributions, then waits again so the slots can be reused.
#[derive(Debug, Clone)]
pub struct LocalCluster {
    rank: usize,
    shared: Arc<ClusterShared>,
}

impl LocalCluster {
    /// Handles for a cluster of `nodes` nodes, one per rank.
    pub fn new(nodes: usize) -> Vec<LocalCluster> {
        let nodes = nodes.max(1);
        let shared = Arc::new(ClusterShared {
            nodes,
            slots: Mutex::new(vec![Contribution::Empty; nodes]),
            sync: Synchronizer::new(nodes),
            halo: Mutex::new(None),
        });
        (0..nodes)
            .map(|rank| LocalCluster {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn exchange(&self, contribution: Contribution) -> Vec<Contribution> {
        self.shared.slots.lock()[self.rank] = contribution;
        self.shared.sync.barrier();
        let all = self.shared.slots.lock().clone();
        self.shared.sync.barrier();
        all
    }
}

impl NetworkManager for LocalCluster {
    fn rank(&self) -> usize {
        self.rank
    }

    fn nodes(&self) -> usize {
        self.shared.nodes
    }

    fn bool_or_reduction(&self, value: bool) -> bool {
        self.exchange(Contribution::Bool(value))
            .iter()
            .any(|c| matches!(c, Contribution::Bool(true)))
    }

    fn float_reduction(&self, values: &mut [f32], op: ReductionOp) {
        let mut wide: Vec<f64> = values.iter().map(|&v| v as f64).collect();
        self.double_reduction(&mut wide, op);
        for (value, reduced) in values.iter_mut().zip(wide) {
            *value = reduced as f32;
        }
    }

    fn double_reduction(&self, values: &mut [f64], op: ReductionOp) {
        let all = self.exchange(Contribution::Doubles(values.to_vec()));
        for (i, value) in values.iter_mut().enumerate() {
            let mut acc: Option<f64> = None;
            for contribution in &all {
                if let Contribution::Doubles(v) = contribution {
                    if let Some(&x) = v.get(i) {
                        acc = Some(acc.map_or(x, |a| op.fold_f64(a, x)));
                    }
                }
            }
            if let Some(acc) = acc {
                *value = acc;
            }
        }
    }

    fn int_reduction(&self, values: &mut [u64], op: ReductionOp) {
        let all = self.exchange(Contribution::Ints(values.to_vec()));
        for (i, value) in values.iter_mut().enumerate() {
            let mut acc: Option<u64> = None;
            for contribution in &all {
                if let Contribution::Ints(v) = contribution {
                    if let Some(&x) = v.get(i) {
                        acc = Some(acc.map_or(x, |a| op.fold_u64(a, x)));
                    }
                }
            }
            if let Some(acc) = acc {
                *value = acc;
            }
        }
    }

    fn all_gather_u32(&self, value: u32) -> Vec<u32> {
        self.exchange(Contribution::Ints(vec![value as u64]))
            .iter()
            .map(|c| match c {
                Contribution::Ints(v) => v.first().copied().unwrap_or(0) as u32,
                _ => 0,
            })
            .collect()
    }

    fn abort(&self) {
        self.shared.sync.force_unlock();
        if let Some(halo) = self.shared.halo.lock().as_ref() {
            halo.force_unlock();
        }
    }

    fn aborted(&self) -> bool {
        self.shared.sync.is_forced_unlocked()
    }

    fn halo_exchange(&self, total_devices: usize) -> Arc<HaloExchange> {
        let mut halo = self.shared.halo.lock();
        match halo.as_ref() {
            Some(existing) if existing.devices() == total_devices => Arc::clone(existing),
            _ => {
                let created = Arc::new(HaloExchange::new(total_devices));
                *halo = Some(Arc::clone(&created));
                created
            }
        }
    }
}
