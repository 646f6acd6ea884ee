/// Process-model factors: random walks between consecutive nodes and the zero-velocity
/// pseudo-measurement.
use nalgebra::{Vector2, Vector3};

use crate::types::Vector6;
use crate::window::{NodeId, NodeState};

/// Shortest interval used for random-walk weighting [s]
const MIN_WALK_DT: f64 = 1e-6;

/// Bias random walk (zero-mean drift between nodes)
#[derive(Clone, Debug)]
pub struct BiasWalkFactor {
    pub from: NodeId,
    pub to: NodeId,
    accel_weight: f64,
    gyro_weight: f64,
}

impl BiasWalkFactor {
    /// `accel_walk` [m/s²/√s] and `gyro_walk` [rad/s/√s] over `dt` seconds
    pub fn new(from: NodeId, to: NodeId, dt: f64, accel_walk: f64, gyro_walk: f64) -> Self {
        let sqrt_dt = dt.max(MIN_WALK_DT).sqrt();
        Self {
            from,
            to,
            accel_weight: 1.0 / (accel_walk * sqrt_dt),
            gyro_weight: 1.0 / (gyro_walk * sqrt_dt),
        }
    }

    pub fn residual(&self, i: &NodeState, j: &NodeState) -> Vector6 {
        let mut r = Vector6::zeros();
        r.fixed_rows_mut::<3>(0)
            .copy_from(&((j.accel_bias - i.accel_bias) * self.accel_weight));
        r.fixed_rows_mut::<3>(3)
            .copy_from(&((j.gyro_bias - i.gyro_bias) * self.gyro_weight));
        r
    }
}

/// Receiver clock model: bias integrates drift, both wander
#[derive(Clone, Debug)]
pub struct ClockWalkFactor {
    pub from: NodeId,
    pub to: NodeId,
    dt: f64,
    bias_weight: f64,
    drift_weight: f64,
}

impl ClockWalkFactor {
    pub fn new(from: NodeId, to: NodeId, dt: f64, bias_walk: f64, drift_walk: f64) -> Self {
        let sqrt_dt = dt.max(MIN_WALK_DT).sqrt();
        Self {
            from,
            to,
            dt,
            bias_weight: 1.0 / (bias_walk * sqrt_dt),
            drift_weight: 1.0 / (drift_walk * sqrt_dt),
        }
    }

    pub fn residual(&self, i: &NodeState, j: &NodeState) -> Vector2<f64> {
        Vector2::new(
            (j.clock[0] - i.clock[0] - i.clock[1] * self.dt) * self.bias_weight,
            (j.clock[1] - i.clock[1]) * self.drift_weight,
        )
    }
}

/// Velocity is known to be zero at this node
#[derive(Clone, Debug)]
pub struct ZeroVelocityFactor {
    pub node: NodeId,
    weight: f64,
}

impl ZeroVelocityFactor {
    pub fn new(node: NodeId, std: f64) -> Self {
        Self {
            node,
            weight: 1.0 / std,
        }
    }

    pub fn residual(&self, state: &NodeState) -> Vector3<f64> {
        state.velocity * self.weight
    }
}
