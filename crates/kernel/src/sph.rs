//! SPH smoothing kernel, equation of state and pair terms.
//!
//! Weakly-compressible SPH with the Wendland C2 kernel (support radius 2h),
//! the Tait equation of state, Monaghan artificial viscosity and the
//! continuity equation for density. Used by the reference CPU device.

use std::f32::consts::PI;

/// Normalization constant for the 3D Wendland C2 kernel: 21 / (16 * pi).
const WENDLAND_C2_NORM_3D: f32 = 21.0 / (16.0 * PI);

/// Smallest time step returned by [`compute_timestep`].
pub const MIN_DT: f32 = 1.0e-8;

/// Wendland C2 smoothing kernel in 3D.
///
/// ```text
/// W(r, h) = (21 / (16 pi h^3)) * (1 - q/2)^4 * (1 + 2q)   for q = r/h <= 2
/// W(r, h) = 0                                                for q > 2
/// ```
pub fn wendland_c2(r: f32, h: f32) -> f32 {
    let q = r / h;
    if q >= 2.0 {
        return 0.0;
    }
    let h3 = h * h * h;
    let t = 1.0 - 0.5 * q;
    let t2 = t * t;
    WENDLAND_C2_NORM_3D / h3 * t2 * t2 * (1.0 + 2.0 * q)
}

/// Gradient of the Wendland C2 kernel for the displacement `d` from
/// particle j to particle i, with `r = |d|`.
///
/// ```text
/// dW/dr = (21 / (16 pi h^3)) * (-5 q) * (1 - q/2)^3 / h
/// ```
///
/// Zero for coincident particles.
pub fn wendland_c2_gradient(d: [f32; 3], r: f32, h: f32) -> [f32; 3] {
    let q = r / h;
    if q >= 2.0 || r < 1.0e-12 {
        return [0.0; 3];
    }
    let h3 = h * h * h;
    let t = 1.0 - 0.5 * q;
    let dw_dr = WENDLAND_C2_NORM_3D / (h3 * h) * (-5.0 * q) * t * t * t;
    let s = dw_dr / r;
    [s * d[0], s * d[1], s * d[2]]
}

/// Tait equation of state, gauge pressure (zero at rest density).
///
/// ```text
/// P = B * ((rho / rho0)^gamma - 1),   B = rho0 * c^2 / gamma
/// ```
pub fn tait_pressure(density: f32, rest_density: f32, speed_of_sound: f32, gamma: f32) -> f32 {
    let b = rest_density * speed_of_sound * speed_of_sound / gamma;
    b * ((density / rest_density).powf(gamma) - 1.0)
}

/// State of one particle as seen by a pair interaction.
#[derive(Debug, Clone, Copy)]
pub struct PairSample {
    /// Velocity, w = density.
    pub vel: [f32; 4],
    /// Mass.
    pub mass: f32,
    /// Pressure from the equation of state.
    pub pressure: f32,
}

/// Constants of the pair interaction.
#[derive(Debug, Clone, Copy)]
pub struct PairConstants {
    /// Smoothing length.
    pub h: f32,
    /// Speed of sound.
    pub speed_of_sound: f32,
    /// Artificial viscosity coefficient.
    pub alpha: f32,
}

/// Contribution of particle j to the acceleration and density rate of i.
///
/// `d` is the displacement from j to i and `r` its length.
///
/// ```text
/// a_i    += -m_j * (P_i/rho_i^2 + P_j/rho_j^2 + Pi_ij) * grad W
/// drho_i +=  m_j * (v_i - v_j) . grad W
/// Pi_ij   = -alpha * c * mu_ij / rho_avg   when (v_i - v_j) . d < 0
/// mu_ij   = h * (v_ij . d) / (r^2 + 0.01 h^2)
/// ```
pub fn pair_terms(i: &PairSample, j: &PairSample, d: [f32; 3], r: f32, k: &PairConstants) -> ([f32; 3], f32) {
    let grad = wendland_c2_gradient(d, r, k.h);
    let rho_i = i.vel[3].max(1.0e-6);
    let rho_j = j.vel[3].max(1.0e-6);

    let dv = [i.vel[0] - j.vel[0], i.vel[1] - j.vel[1], i.vel[2] - j.vel[2]];
    let vr = dv[0] * d[0] + dv[1] * d[1] + dv[2] * d[2];

    let mut visc = 0.0;
    if vr < 0.0 {
        let mu = k.h * vr / (r * r + 0.01 * k.h * k.h);
        visc = -k.alpha * k.speed_of_sound * mu / (0.5 * (rho_i + rho_j));
    }

    let factor = -j.mass * (i.pressure / (rho_i * rho_i) + j.pressure / (rho_j * rho_j) + visc);
    let acc = [factor * grad[0], factor * grad[1], factor * grad[2]];
    let drho = j.mass * (dv[0] * grad[0] + dv[1] * grad[1] + dv[2] * grad[2]);
    (acc, drho)
}

/// Adaptive time step: minimum of the CFL condition on the signal speed and
/// the force criterion, clamped to `[MIN_DT, max_dt]`.
///
/// ```text
/// dt_cfl   = cfl * h / (c + v_max)
/// dt_force = 0.25 * sqrt(h / a_max)
/// ```
pub fn compute_timestep(max_speed: f32, max_accel: f32, h: f32, speed_of_sound: f32, cfl: f32, max_dt: f32) -> f32 {
    let dt_cfl = cfl * h / (speed_of_sound + max_speed);
    let dt_force = if max_accel > 1.0e-12 {
        0.25 * (h / max_accel).sqrt()
    } else {
        max_dt
    };
    dt_cfl.min(dt_force).clamp(MIN_DT, max_dt.max(MIN_DT))
}
