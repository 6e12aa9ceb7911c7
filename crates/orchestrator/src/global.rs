//! State shared between the coordinator and the worker threads.
//!
//! The coordinator writes the host-side fields only between two commands,
//! while every worker waits on the synchronizer; workers read them during a
//! command. The locks are never contended for long.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kernel::{
    BufferList, Command, DeviceMap, DeviceReport, GlobalDeviceId, Grid, PhysicsParams, SegmentTable, StepParams,
    Topology,
};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::decomposition::Partition;
use crate::sync::{HaloExchange, Synchronizer};

/// Shared simulation state.
#[derive(Debug)]
pub struct GlobalData {
    /// Nodes and devices of the run.
    pub topology: Topology,
    /// This node.
    pub rank: usize,
    /// World grid.
    pub grid: Arc<Grid>,
    /// Cell ownership.
    pub device_map: Arc<DeviceMap>,
    /// Physical constants.
    pub physics: Arc<PhysicsParams>,
    /// Coordinator plus one party per local device.
    pub sync: Synchronizer,
    /// Board for halo commands, shared by every device of the run.
    pub halo: Arc<HaloExchange>,
    /// Command being executed.
    pub command: RwLock<Command>,
    /// Per-step values read by upload commands.
    pub step: RwLock<StepParams>,
    /// Host particle buffers.
    pub host: RwLock<BufferList>,
    /// Host range of each local device.
    pub partition: RwLock<Partition>,
    /// One report per local device.
    pub reports: Vec<Mutex<DeviceReport>>,
    /// Host mirror of each local device's segment table.
    pub segments: Mutex<Vec<SegmentTable>>,
    keep_going: AtomicBool,
}

impl GlobalData {
    /// State for node `rank` of `topology`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topology: Topology,
        rank: usize,
        grid: Arc<Grid>,
        device_map: Arc<DeviceMap>,
        physics: Arc<PhysicsParams>,
        halo: Arc<HaloExchange>,
        host: BufferList,
        partition: Partition,
    ) -> Self {
        let devices = topology.devices_per_node();
        Self {
            topology,
            rank,
            grid,
            device_map,
            physics,
            sync: Synchronizer::new(devices + 1),
            halo,
            command: RwLock::new(Command::IDLE),
            step: RwLock::new(StepParams::default()),
            host: RwLock::new(host),
            partition: RwLock::new(partition),
            reports: (0..devices).map(|_| Mutex::new(DeviceReport::default())).collect(),
            segments: Mutex::new(vec![SegmentTable::empty(); devices]),
            keep_going: AtomicBool::new(true),
        }
    }

    /// Devices driven by this node.
    pub fn devices(&self) -> usize {
        self.topology.devices_per_node()
    }

    /// Global number of local device `device`.
    pub fn device_number(&self, device: usize) -> usize {
        self.topology.global_device_number(GlobalDeviceId {
            node: self.rank,
            device,
        })
    }

    /// More than one device across the run.
    pub fn multi_device(&self) -> bool {
        self.topology.total_devices() > 1
    }

    /// More than one node.
    pub fn multi_node(&self) -> bool {
        self.topology.nodes() > 1
    }

    /// False once the run must stop.
    pub fn keep_going(&self) -> bool {
        self.keep_going.load(Ordering::SeqCst)
    }

    /// Ask everybody to stop at the next check.
    pub fn stop(&self) {
        self.keep_going.store(false, Ordering::SeqCst);
    }

    /// Report of local device `device`.
    pub fn report(&self, device: usize) -> MutexGuard<'_, DeviceReport> {
        self.reports[device].lock()
    }

    /// Release every thread blocked on a barrier, for good.
    pub fn force_unlock(&self) {
        self.sync.force_unlock();
        self.halo.force_unlock();
    }
}
