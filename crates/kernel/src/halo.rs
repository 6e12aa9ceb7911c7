//! Halo packets exchanged between devices.
//!
//! During `AppendExternal` and `UpdateExternal` every device publishes the
//! particles of its inner-edge segment; peers pick from each packet the
//! particles that fall in their own outer-edge cells.
//!
//! An append also carries the particles that crossed into foreign cells
//! since the previous rebuild. The device owning their new cell adopts them.

use crate::buffers::{BufferData, BufferKind};

/// Edge particles published by one device.
#[derive(Debug, Clone, Default)]
pub struct HaloPacket {
    /// Global device number of the publisher.
    pub source: usize,
    /// Hash of every particle, in publishing order.
    pub hashes: Vec<u64>,
    /// Field payloads, one entry per exported field.
    pub fields: Vec<(BufferKind, BufferData)>,
    /// Hash of every particle that left the publisher.
    pub migrant_hashes: Vec<u64>,
    /// Every field of those particles.
    pub migrants: Vec<(BufferKind, BufferData)>,
}

impl HaloPacket {
    /// Empty packet from `source`.
    pub fn new(source: usize) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    /// Number of particles in the packet.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// True if the packet holds no particle.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Payload of one field.
    pub fn field(&self, kind: BufferKind) -> Option<&BufferData> {
        self.fields.iter().find(|(k, _)| *k == kind).map(|(_, data)| data)
    }
}
