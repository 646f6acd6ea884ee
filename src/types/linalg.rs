//! Linear algebra type system for the fusion core
//!
//! Fixed-size aliases for every block the estimator touches, plus the SO(3) helpers
//! shared by preintegration, factors and the solver.

use nalgebra::{Matrix3, SMatrix, SVector, UnitQuaternion, Vector3};

// ===== Node error-state layout =====
// [position (0:3), rotation (3:6), velocity (6:9), accel bias (9:12), gyro bias (12:15), clock (15:17)]
pub const NODE_DIM: usize = 17;
pub const IDX_POS: usize = 0;
pub const IDX_ROT: usize = 3;
pub const IDX_VEL: usize = 6;
pub const IDX_BA: usize = 9;
pub const IDX_BG: usize = 12;
pub const IDX_CLK: usize = 15;

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_IMU: usize = 6; // specific force + angular rate
pub const PREINT_DIM: usize = 9; // (dp, dv, dtheta)

pub type Vector2 = nalgebra::Vector2<f64>;
pub type Vector6 = nalgebra::Vector6<f64>;
pub type Matrix2 = nalgebra::Matrix2<f64>;
pub type Matrix6 = nalgebra::Matrix6<f64>;
pub type Matrix9 = SMatrix<f64, PREINT_DIM, PREINT_DIM>;
pub type Matrix9x6 = SMatrix<f64, PREINT_DIM, MEASURE_DIM_IMU>;
pub type Vector9 = SVector<f64, PREINT_DIM>;
pub type NodeVec = SVector<f64, NODE_DIM>;

/// Gravity magnitude (m/s²); world frame is local ENU, gravity along -z
pub const G: f64 = 9.81;

pub fn gravity() -> Vector3<f64> {
    Vector3::new(0.0, 0.0, -G)
}

/// Create a skew-symmetric matrix from a 3D vector
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// SO(3) exponential map on unit quaternions
pub fn exp_so3(omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*omega)
}

/// SO(3) logarithm, shortest rotation vector
///
/// Uses atan2 on the vector part so tiny rotations keep full precision.
pub fn log_so3(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let (mut w, mut xyz) = (q.w, q.imag());
    if w < 0.0 {
        w = -w;
        xyz = -xyz;
    }
    let norm_xyz = xyz.norm();
    if norm_xyz < 1e-12 {
        // Near identity: log(q) ≈ 2 * xyz
        2.0 * xyz
    } else {
        2.0 * norm_xyz.atan2(w) / norm_xyz * xyz
    }
}

/// Right Jacobian of SO(3)
pub fn right_jacobian(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let k = skew_symmetric(omega);
    if theta < 1e-6 {
        return Matrix3::identity() - 0.5 * k;
    }
    let theta2 = theta * theta;
    Matrix3::identity() - (1.0 - theta.cos()) / theta2 * k
        + (theta - theta.sin()) / (theta2 * theta) * k * k
}

/// True when `m` is symmetric (to a relative tolerance) and admits a Cholesky factor
pub fn is_positive_definite<const D: usize>(m: &SMatrix<f64, D, D>) -> bool {
    if m.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let scale = m.amax().max(1e-300);
    if (m - m.transpose()).amax() > 1e-9 * scale {
        return false;
    }
    m.cholesky().is_some()
}

/// Square-root information `L^T` such that `L^T * L = cov^-1`.
///
/// Returns `None` when `cov` is not positive definite.
pub fn sqrt_information<const D: usize>(cov: &SMatrix<f64, D, D>) -> Option<SMatrix<f64, D, D>> {
    let info = cov.cholesky()?.inverse();
    let chol = info.cholesky()?;
    Some(chol.l().transpose())
}
