//! Single-point least-squares positioning
//!
//! Used once per session to anchor the local ENU frame and seed the receiver clock.

use nalgebra::{Matrix4, Vector3, Vector4};

use super::processor::ResolvedObservation;
use super::{sagnac_range, SPEED_OF_LIGHT};

const MAX_ITERATIONS: usize = 10;
pub const MIN_SATELLITES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointFix {
    pub position_ecef: Vector3<f64>,
    /// Receiver clock bias [m]
    pub clock_bias: f64,
    pub iterations: usize,
}

/// Gauss-Newton on (x, y, z, clock) starting from the Earth's centre.
///
/// Returns `None` with fewer than four satellites or when the geometry is singular.
pub fn point_position(observations: &[ResolvedObservation]) -> Option<PointFix> {
    if observations.len() < MIN_SATELLITES {
        return None;
    }

    let mut x = Vector4::zeros();
    for iteration in 0..MAX_ITERATIONS {
        let receiver = Vector3::new(x[0], x[1], x[2]);
        let mut h = Matrix4::zeros();
        let mut g = Vector4::zeros();
        for obs in observations {
            let range = sagnac_range(&obs.satellite.position, &receiver);
            let los = (obs.satellite.position - receiver) / range.max(1.0);
            let predicted = range + x[3] - SPEED_OF_LIGHT * obs.satellite.clock_bias;
            let residual = obs.pseudorange - predicted;
            let row = Vector4::new(-los[0], -los[1], -los[2], 1.0);
            h += row * row.transpose();
            g += row * residual;
        }
        let dx = h.cholesky()?.solve(&g);
        x += dx;
        if dx.norm() < 1e-4 {
            return Some(PointFix {
                position_ecef: Vector3::new(x[0], x[1], x[2]),
                clock_bias: x[3],
                iterations: iteration + 1,
            });
        }
    }
    log::warn!("point positioning did not converge in {MAX_ITERATIONS} iterations");
    None
}
