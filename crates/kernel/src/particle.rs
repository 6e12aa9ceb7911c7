//! Per-particle type information stored in the `Info` buffer.
//!
//! Every particle carries a compact, `Pod` record with its type, state flags,
//! the rigid body it belongs to (if any) and a globally unique id. The record
//! is copied byte-for-byte into checkpoints.

use bytemuck::{Pod, Zeroable};

/// Particle type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ParticleType {
    /// Moving fluid particle.
    Fluid = 0,
    /// Fixed wall particle.
    Boundary = 1,
    /// Particle rigidly attached to a moving body.
    Object = 2,
}

impl ParticleType {
    fn from_raw(raw: u16) -> Self {
        match raw {
            1 => ParticleType::Boundary,
            2 => ParticleType::Object,
            _ => ParticleType::Fluid,
        }
    }
}

/// The particle no longer takes part in the simulation and is dropped at the
/// next neighbour-list rebuild.
pub const FLAG_INACTIVE: u16 = 1 << 0;
/// The particle was created by an open boundary during the run.
pub const FLAG_CREATED: u16 = 1 << 1;
/// The particle crossed an outlet and is about to be disabled.
pub const FLAG_OUTGOING: u16 = 1 << 2;

/// Compact particle descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct ParticleInfo {
    /// Raw [`ParticleType`].
    pub ptype: u16,
    /// Bit set of `FLAG_*` values.
    pub flags: u16,
    /// Rigid body index for object particles, zero otherwise.
    pub object: u16,
    /// Fluid index for fluid particles, zero otherwise.
    pub fluid: u16,
    /// Globally unique particle id.
    pub id: u32,
}

impl ParticleInfo {
    /// Fluid particle with the given id.
    pub fn fluid(id: u32) -> Self {
        Self {
            ptype: ParticleType::Fluid as u16,
            id,
            ..Self::default()
        }
    }

    /// Wall particle with the given id.
    pub fn boundary(id: u32) -> Self {
        Self {
            ptype: ParticleType::Boundary as u16,
            id,
            ..Self::default()
        }
    }

    /// Particle of rigid body `object` with the given id.
    pub fn object(object: u16, id: u32) -> Self {
        Self {
            ptype: ParticleType::Object as u16,
            object,
            id,
            ..Self::default()
        }
    }

    /// Decoded particle type.
    pub fn particle_type(&self) -> ParticleType {
        ParticleType::from_raw(self.ptype)
    }

    /// True for fluid particles.
    pub fn is_fluid(&self) -> bool {
        self.particle_type() == ParticleType::Fluid
    }

    /// True for object particles.
    pub fn is_object(&self) -> bool {
        self.particle_type() == ParticleType::Object
    }

    /// True unless the particle has been disabled.
    pub fn is_active(&self) -> bool {
        self.flags & FLAG_INACTIVE == 0
    }

    /// Mark the particle as disabled.
    pub fn deactivate(&mut self) {
        self.flags |= FLAG_INACTIVE;
    }

    /// True if the flag bit is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}
