//! Host-side rigid body dynamics.
//!
//! Bodies are integrated with the same two-stage scheme as the particles:
//! stage 1 advances the saved state by dt/2 with the derivatives at time n,
//! stage 2 advances the saved state by dt with the derivatives at n + 1/2.
//! The inertia tensor is kept diagonal in world axes; the orientation itself
//! is carried by the object particles, which move with the body's point
//! velocity.

use kernel::BodyMotion;

/// One rigid body.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidBody {
    mass: f64,
    inertia: [f64; 3],
    state: BodyMotion,
    saved: BodyMotion,
    fixed_motion: bool,
}

impl RigidBody {
    /// Body at rest with center of gravity `cg` (relative to the world origin).
    pub fn new(mass: f64, inertia: [f64; 3], cg: [f64; 3]) -> Self {
        let state = BodyMotion {
            cg,
            ..BodyMotion::default()
        };
        Self {
            mass,
            inertia,
            state,
            saved: state,
            fixed_motion: false,
        }
    }

    /// Solid box of uniform density between `min` and `max`.
    pub fn solid_box(min: [f64; 3], max: [f64; 3], mass: f64) -> Self {
        let l = [max[0] - min[0], max[1] - min[1], max[2] - min[2]];
        let inertia = [
            mass / 12.0 * (l[1] * l[1] + l[2] * l[2]),
            mass / 12.0 * (l[0] * l[0] + l[2] * l[2]),
            mass / 12.0 * (l[0] * l[0] + l[1] * l[1]),
        ];
        let cg = [
            0.5 * (min[0] + max[0]),
            0.5 * (min[1] + max[1]),
            0.5 * (min[2] + max[2]),
        ];
        Self::new(mass, inertia, cg)
    }

    /// Set the linear velocity.
    pub fn with_velocity(mut self, velocity: [f64; 3]) -> Self {
        self.state.velocity = velocity;
        self.saved = self.state;
        self
    }

    /// Move with constant velocity, ignoring forces.
    pub fn with_fixed_motion(mut self, fixed: bool) -> Self {
        self.fixed_motion = fixed;
        self
    }

    /// Total mass.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Current motion.
    pub fn motion(&self) -> BodyMotion {
        self.state
    }

    /// Replace the current motion, e.g. when resuming.
    pub fn set_motion(&mut self, motion: BodyMotion) {
        self.state = motion;
        self.saved = motion;
    }

    /// Advance one integration stage under the hydrodynamic `force` and
    /// `torque` plus gravity.
    pub fn timestep(&mut self, step: u8, dt: f64, force: [f64; 3], torque: [f64; 3], gravity: [f32; 3]) {
        let factor = if step == 1 {
            self.saved = self.state;
            0.5 * dt
        } else {
            dt
        };
        // drift with the velocity of the current stage
        let drift = self.state.velocity;

        let mut next = self.saved;
        if !self.fixed_motion {
            for a in 0..3 {
                let accel = force[a] / self.mass + gravity[a] as f64;
                next.velocity[a] = self.saved.velocity[a] + factor * accel;
                if self.inertia[a] > 0.0 {
                    next.omega[a] = self.saved.omega[a] + factor * torque[a] / self.inertia[a];
                }
            }
        }
        for a in 0..3 {
            next.cg[a] = self.saved.cg[a] + factor * drift[a];
        }
        self.state = next;
    }
}
