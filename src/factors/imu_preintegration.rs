/// IMU Preintegration Factor
///
/// Implements the standard Forster/VINS-Mono manifold theory for IMU preintegration.
/// This factor constrains two consecutive nodes (pose, velocity, biases) based on the
/// high-rate IMU samples between them, accounting for bias drift via first-order bias
/// correction.
///
/// References:
/// - Forster et al., "On-Manifold Preintegration for Real-Time Visual-Inertial Odometry"
/// - Qin et al., "VINS-Mono: A Robust and Versatile Monocular Visual-Inertial State Estimator"
use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use crate::config::IntegrationScheme;
use crate::measurement::ImuSample;
use crate::types::{
    exp_so3, gravity, log_so3, right_jacobian, skew_symmetric, sqrt_information, Matrix6,
    Matrix9, Matrix9x6, Vector9,
};
use crate::window::{NodeId, NodeState};

/// Added to the preintegrated covariance before inversion; the first few samples leave
/// position and velocity fully correlated.
const COVARIANCE_FLOOR: f64 = 1e-12;

/// Preintegrated IMU measurements between two nodes
///
/// All quantities are expressed in the body frame of the first node.
#[derive(Clone, Debug)]
pub struct PreintegratedImuMeasurements {
    /// Position delta: ∫∫ R a dt dt over the interval
    pub delta_p: Vector3<f64>,

    /// Velocity delta: ∫ R a dt over the interval
    pub delta_v: Vector3<f64>,

    /// Rotation delta: ∏ Exp(ω dt)
    pub delta_q: UnitQuaternion<f64>,

    /// Total time elapsed [seconds]
    pub sum_dt: f64,

    pub num_samples: usize,

    /// Accelerometer bias used during integration [m/s²]
    pub nominal_accel_bias: Vector3<f64>,

    /// Gyroscope bias used during integration [rad/s]
    pub nominal_gyro_bias: Vector3<f64>,

    /// ∂Δp / ∂ba
    pub dp_dba: Matrix3<f64>,
    /// ∂Δp / ∂bg
    pub dp_dbg: Matrix3<f64>,
    /// ∂Δv / ∂ba
    pub dv_dba: Matrix3<f64>,
    /// ∂Δv / ∂bg
    pub dv_dbg: Matrix3<f64>,
    /// ∂ΔR / ∂bg (right perturbation)
    pub dq_dbg: Matrix3<f64>,

    /// Covariance of (Δp, Δv, Δθ)
    pub covariance: Matrix9,
}

impl PreintegratedImuMeasurements {
    pub fn new(accel_bias: Vector3<f64>, gyro_bias: Vector3<f64>) -> Self {
        Self {
            delta_p: Vector3::zeros(),
            delta_v: Vector3::zeros(),
            delta_q: UnitQuaternion::identity(),
            sum_dt: 0.0,
            num_samples: 0,
            nominal_accel_bias: accel_bias,
            nominal_gyro_bias: gyro_bias,
            dp_dba: Matrix3::zeros(),
            dp_dbg: Matrix3::zeros(),
            dv_dba: Matrix3::zeros(),
            dv_dbg: Matrix3::zeros(),
            dq_dbg: Matrix3::zeros(),
            covariance: Matrix9::zeros(),
        }
    }

    /// Integrate one accel/gyro step of length `dt` with per-sample noise `noise`
    /// (accel 0:3, gyro 3:6)
    pub fn integrate_measurement(
        &mut self,
        accel: Vector3<f64>,
        gyro: Vector3<f64>,
        dt: f64,
        noise: &Matrix6,
    ) {
        let a = accel - self.nominal_accel_bias;
        let w = gyro - self.nominal_gyro_bias;
        let dr = *self.delta_q.to_rotation_matrix().matrix();
        let a_skew = skew_symmetric(&a);
        let theta = w * dt;
        let step = exp_so3(&theta);
        let step_rt = step.to_rotation_matrix().matrix().transpose();
        let jr = right_jacobian(&theta);
        let dt2 = dt * dt;

        // Noise propagation in (Δp, Δv, Δθ) order
        let mut a_mat = Matrix9::identity();
        a_mat
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(Matrix3::identity() * dt));
        a_mat
            .fixed_view_mut::<3, 3>(0, 6)
            .copy_from(&(-0.5 * dr * a_skew * dt2));
        a_mat
            .fixed_view_mut::<3, 3>(3, 6)
            .copy_from(&(-dr * a_skew * dt));
        a_mat.fixed_view_mut::<3, 3>(6, 6).copy_from(&step_rt);
        let mut b_mat = Matrix9x6::zeros();
        b_mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&(0.5 * dr * dt2));
        b_mat.fixed_view_mut::<3, 3>(3, 0).copy_from(&(dr * dt));
        b_mat.fixed_view_mut::<3, 3>(6, 3).copy_from(&(jr * dt));
        self.covariance =
            a_mat * self.covariance * a_mat.transpose() + b_mat * noise * b_mat.transpose();

        // Bias Jacobians use the values from before this step
        self.dp_dba += self.dv_dba * dt - 0.5 * dr * dt2;
        self.dp_dbg += self.dv_dbg * dt - 0.5 * dr * a_skew * self.dq_dbg * dt2;
        self.dv_dba -= dr * dt;
        self.dv_dbg -= dr * a_skew * self.dq_dbg * dt;
        self.dq_dbg = step_rt * self.dq_dbg - jr * dt;

        self.delta_p += self.delta_v * dt + 0.5 * dr * a * dt2;
        self.delta_v += dr * a * dt;
        self.delta_q *= step;

        self.sum_dt += dt;
        self.num_samples += 1;
    }

    /// Deltas corrected to first order for biases `ba`, `bg`
    pub fn corrected(
        &self,
        accel_bias: &Vector3<f64>,
        gyro_bias: &Vector3<f64>,
    ) -> (Vector3<f64>, Vector3<f64>, UnitQuaternion<f64>) {
        let dba = accel_bias - self.nominal_accel_bias;
        let dbg = gyro_bias - self.nominal_gyro_bias;
        let dp = self.delta_p + self.dp_dba * dba + self.dp_dbg * dbg;
        let dv = self.delta_v + self.dv_dba * dba + self.dv_dbg * dbg;
        let dq = self.delta_q * exp_so3(&(self.dq_dbg * dbg));
        (dp, dv, dq)
    }

    /// State at the end of the interval starting from `start`
    pub fn predict(&self, start: &NodeState) -> NodeState {
        let (dp, dv, dq) = self.corrected(&start.accel_bias, &start.gyro_bias);
        let dt = self.sum_dt;
        let g = gravity();
        let r = start.pose.attitude;
        let mut out = start.clone();
        out.pose.position =
            start.pose.position + start.velocity * dt + 0.5 * g * dt * dt + r * dp;
        out.velocity = start.velocity + g * dt + r * dv;
        out.pose.attitude = r * dq;
        out.clock[0] = start.clock[0] + start.clock[1] * dt;
        out
    }
}

/// IMU preintegration factor between consecutive nodes
///
/// The residual is the difference between the predicted and preintegrated state change,
/// with first-order correction for bias drift, whitened by the preintegrated covariance.
#[derive(Clone, Debug)]
pub struct ImuFactor {
    pub from: NodeId,
    pub to: NodeId,
    pub preintegration: PreintegratedImuMeasurements,
    sqrt_info: Matrix9,
}

impl ImuFactor {
    pub fn new(from: NodeId, to: NodeId, preintegration: PreintegratedImuMeasurements) -> Self {
        let covariance = preintegration.covariance + Matrix9::identity() * COVARIANCE_FLOOR;
        let sqrt_info = sqrt_information(&covariance).unwrap_or_else(Matrix9::identity);
        Self {
            from,
            to,
            preintegration,
            sqrt_info,
        }
    }

    /// Whitened residual [position (0:3), velocity (3:6), rotation (6:9)]
    pub fn residual(&self, i: &NodeState, j: &NodeState) -> Vector9 {
        let (dp, dv, dq) = self
            .preintegration
            .corrected(&i.accel_bias, &i.gyro_bias);
        let dt = self.preintegration.sum_dt;
        let g = gravity();
        let ri_inv = i.pose.attitude.inverse();

        let pos_change =
            j.pose.position - i.pose.position - i.velocity * dt - 0.5 * g * dt * dt;
        let vel_change = j.velocity - i.velocity - g * dt;

        let mut residual = Vector9::zeros();
        residual
            .fixed_rows_mut::<3>(0)
            .copy_from(&(ri_inv * pos_change - dp));
        residual
            .fixed_rows_mut::<3>(3)
            .copy_from(&(ri_inv * vel_change - dv));
        residual
            .fixed_rows_mut::<3>(6)
            .copy_from(&log_so3(&(dq.inverse() * ri_inv * j.pose.attitude)));
        self.sqrt_info * residual
    }
}

/// Accumulates IMU samples since the latest node
#[derive(Clone, Debug)]
pub struct ImuPropagator {
    scheme: IntegrationScheme,
    last: Option<(f64, ImuSample)>,
    preintegration: PreintegratedImuMeasurements,
}

impl ImuPropagator {
    pub fn new(scheme: IntegrationScheme) -> Self {
        Self {
            scheme,
            last: None,
            preintegration: PreintegratedImuMeasurements::new(Vector3::zeros(), Vector3::zeros()),
        }
    }

    pub fn last_time(&self) -> Option<f64> {
        self.last.as_ref().map(|(t, _)| *t)
    }

    pub fn last_sample(&self) -> Option<&ImuSample> {
        self.last.as_ref().map(|(_, s)| s)
    }

    pub fn current(&self) -> &PreintegratedImuMeasurements {
        &self.preintegration
    }

    /// Record a sample; when `integrate` is set the step since the previous sample is
    /// added to the running preintegration. A sample older than the latest one is ignored so
    /// no stretch of time is integrated twice.
    pub fn push(&mut self, t: f64, sample: ImuSample, integrate: bool) {
        if self.last_time().is_some_and(|t0| t < t0) {
            log::debug!("IMU sample at {t:.6}s behind propagator, ignored");
            return;
        }
        if integrate {
            if let Some((t0, prev)) = &self.last {
                let dt = t - t0;
                if dt > 0.0 {
                    let (accel, gyro, noise) = match self.scheme {
                        IntegrationScheme::Euler => (prev.accel(), prev.gyro(), prev.covariance),
                        IntegrationScheme::Midpoint => (
                            0.5 * (prev.accel() + sample.accel()),
                            0.5 * (prev.gyro() + sample.gyro()),
                            sample.covariance,
                        ),
                    };
                    self.preintegration
                        .integrate_measurement(accel, gyro, dt, &noise);
                }
            }
        }
        self.last = Some((t, sample));
    }

    /// Extend the running preintegration to `t` holding the last sample
    pub fn hold_to(&mut self, t: f64) {
        if let Some((t0, prev)) = &mut self.last {
            let dt = t - *t0;
            if dt > 0.0 {
                self.preintegration.integrate_measurement(
                    prev.accel(),
                    prev.gyro(),
                    dt,
                    &prev.covariance,
                );
                *t0 = t;
            }
        }
    }

    /// Hand over the accumulated interval and restart at the given biases
    pub fn take(
        &mut self,
        accel_bias: Vector3<f64>,
        gyro_bias: Vector3<f64>,
    ) -> PreintegratedImuMeasurements {
        std::mem::replace(
            &mut self.preintegration,
            PreintegratedImuMeasurements::new(accel_bias, gyro_bias),
        )
    }
}
