//! Device worker threads.
//!
//! A worker goes through the same barrier rounds as the coordinator:
//!
//! ```text
//! create kernel      | barrier   end of initialization
//!                    | barrier   start of upload
//! upload partition   | barrier   end of upload
//! loop:              | barrier   command posted
//!   Quit or stopped? |           -> leave
//!   execute          | barrier   command done
//!                    | barrier   start of finalization
//! drop kernel        | barrier   end of finalization
//! ```
//!
//! A failing worker clears `keep_going` before its next barrier and never
//! skips one, so nobody is left waiting.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use kernel::{Command, CommandType, DeviceContext, DeviceFactory, DeviceKernel, DeviceSetup, HaloPacket, KernelError};
use tracing::{debug, error, info};

use crate::error::SimError;
use crate::global::GlobalData;

/// Start the worker of local device `device`.
pub fn spawn(
    gdata: Arc<GlobalData>,
    device: usize,
    factory: DeviceFactory,
    setup: DeviceSetup,
) -> Result<JoinHandle<()>, SimError> {
    thread::Builder::new()
        .name(format!("device-{}", device))
        .spawn(move || run(gdata, device, factory, setup))
        .map_err(|source| SimError::Spawn { device, source })
}

fn run(gdata: Arc<GlobalData>, device: usize, factory: DeviceFactory, setup: DeviceSetup) {
    let mut kernel = match factory(&setup) {
        Ok(kernel) => Some(kernel),
        Err(e) => {
            error!("device {}: initialization failed: {}", device, e);
            gdata.stop();
            None
        }
    };
    gdata.sync.barrier(); // end of initialization

    gdata.sync.barrier(); // start of upload
    if let Some(k) = kernel.as_mut() {
        if gdata.keep_going() {
            if let Err(e) = execute(k.as_mut(), &gdata, device, &Command::new(CommandType::Upload)) {
                error!("device {}: upload failed: {}", device, e);
                gdata.stop();
            }
        }
    }
    gdata.sync.barrier(); // end of upload

    let mut executed = 0u64;
    loop {
        gdata.sync.barrier(); // command posted
        let command = *gdata.command.read();
        if command.kind == CommandType::Quit || !gdata.keep_going() {
            break;
        }
        match kernel.as_mut() {
            Some(k) => {
                let result = if command.kind.is_halo() {
                    exchange(k.as_mut(), &gdata, device, &command)
                } else {
                    execute(k.as_mut(), &gdata, device, &command)
                };
                if let Err(e) = result {
                    error!("device {}: {:?} failed: {}", device, command.kind, e);
                    gdata.stop();
                }
            }
            None => gdata.stop(),
        }
        executed += 1;
        gdata.sync.barrier(); // command done
    }

    gdata.sync.barrier(); // start of finalization
    if let Some(k) = kernel.take() {
        debug!(
            "device {}: releasing {} particles after {} commands",
            device,
            k.particle_count(),
            executed
        );
        drop(k);
    }
    gdata.sync.barrier(); // end of finalization
    info!("device {} finished", device);
}

fn execute(
    kernel: &mut dyn DeviceKernel,
    gdata: &GlobalData,
    device: usize,
    command: &Command,
) -> Result<(), KernelError> {
    let step = gdata.step.read();
    let partition = gdata.partition.read().range(device);
    let mut report = gdata.report(device);
    let mut ctx = DeviceContext {
        device,
        device_number: gdata.device_number(device),
        total_devices: gdata.topology.total_devices(),
        step: &step,
        host: &gdata.host,
        partition,
        report: &mut report,
    };
    kernel.execute(command, &mut ctx)
}

/// Both halves of a halo command. The peer barriers are always reached,
/// whatever happens to this device.
fn exchange(
    kernel: &mut dyn DeviceKernel,
    gdata: &GlobalData,
    device: usize,
    command: &Command,
) -> Result<(), KernelError> {
    let step = gdata.step.read();
    let partition = gdata.partition.read().range(device);
    let device_number = gdata.device_number(device);
    let mut report = gdata.report(device);
    let mut ctx = DeviceContext {
        device,
        device_number,
        total_devices: gdata.topology.total_devices(),
        step: &step,
        host: &gdata.host,
        partition,
        report: &mut report,
    };

    let (packet, exported) = match kernel.export_halo(command, &ctx) {
        Ok(packet) => (packet, Ok(())),
        Err(e) => (HaloPacket::new(device_number), Err(e)),
    };
    gdata.halo.publish(device_number, Arc::new(packet));
    gdata.halo.barrier();

    let imported = exported.and_then(|_| {
        let packets = gdata.halo.packets();
        kernel.import_halo(command, &packets, &mut ctx)
    });
    gdata.halo.barrier();
    imported
}
