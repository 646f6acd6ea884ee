//! Rigid-body transform (position + attitude)

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::linalg::{exp_so3, log_so3, Vector6};

/// Transform from a child frame into its parent frame: `x_parent = q * x_child + p`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vector3<f64>,
    pub attitude: UnitQuaternion<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn new(position: Vector3<f64>, attitude: UnitQuaternion<f64>) -> Self {
        Self { position, attitude }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    /// `self ∘ other`
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose::new(
            self.position + self.attitude * other.position,
            self.attitude * other.attitude,
        )
    }

    pub fn inverse(&self) -> Pose {
        let q_inv = self.attitude.inverse();
        Pose::new(-(q_inv * self.position), q_inv)
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.attitude * point + self.position
    }

    /// Apply a local perturbation `[dp, dtheta]`; rotation is perturbed on the right.
    pub fn boxplus(&self, delta: &Vector6) -> Pose {
        let dp = delta.fixed_rows::<3>(0).into_owned();
        let dth = delta.fixed_rows::<3>(3).into_owned();
        Pose::new(self.position + dp, self.attitude * exp_so3(&dth))
    }

    /// Inverse of `boxplus`: `reference.boxplus(self.boxminus(reference)) == self`
    pub fn boxminus(&self, reference: &Pose) -> Vector6 {
        let mut out = Vector6::zeros();
        out.fixed_rows_mut::<3>(0)
            .copy_from(&(self.position - reference.position));
        out.fixed_rows_mut::<3>(3)
            .copy_from(&log_so3(&(reference.attitude.inverse() * self.attitude)));
        out
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.attitude.coords.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_compose_with_inverse_is_identity() {
        let pose = Pose::new(
            Vector3::new(1.0, -2.0, 0.5),
            UnitQuaternion::from_euler_angles(0.1, -0.3, 1.2),
        );
        let id = pose.compose(&pose.inverse());
        assert_relative_eq!(id.position, Vector3::zeros(), epsilon = 1e-12);
        assert!(log_so3(&id.attitude).norm() < 1e-12);
    }

    #[test]
    fn test_boxplus_boxminus() {
        let reference = Pose::new(
            Vector3::new(3.0, 0.0, 1.0),
            UnitQuaternion::from_euler_angles(0.2, 0.0, -0.4),
        );
        let delta = Vector6::new(0.1, -0.2, 0.3, 0.01, 0.02, -0.03);
        let moved = reference.boxplus(&delta);
        assert_relative_eq!(moved.boxminus(&reference), delta, epsilon = 1e-12);
    }
}
