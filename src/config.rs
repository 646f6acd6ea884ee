//! Estimator configuration, fixed at construction

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};
use crate::gnss::GnssProcessorConfig;
use crate::types::{Pose, Vector2};

const MIN_POINT_DEPTH: f64 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationScheme {
    /// Zero-order hold on the previous sample
    Euler,
    /// Average of the previous and current samples
    Midpoint,
}

/// Pinhole intrinsics and the camera's mounting on the body
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Camera frame expressed in the body frame
    pub body_to_camera: Pose,
}

impl CameraConfig {
    /// Pixel of a point in the camera frame; `None` behind the image plane
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2> {
        if p.z <= MIN_POINT_DEPTH {
            return None;
        }
        Some(Vector2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Unit bearing through a pixel
    pub fn bearing(&self, pixel: &Vector2) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
        .normalize()
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fx: 400.0,
            fy: 400.0,
            cx: 320.0,
            cy: 240.0,
            body_to_camera: Pose::identity(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    // ── Time ordering ──
    /// Tolerance ε [s]; timestamps within 2ε are the same instant
    pub time_tolerance: f64,

    // ── Window ──
    pub max_window_nodes: usize,
    pub integration: IntegrationScheme,
    /// Events kept between drains; the oldest are discarded beyond this
    pub max_buffered_events: usize,

    // ── Keyframes ──
    pub min_feature_count: usize,
    /// Mean pixel displacement against the last keyframe [px]
    pub min_parallax: f64,
    pub camera: CameraConfig,
    /// Inverse depth given to landmarks without a measured depth [1/m]
    pub default_inverse_depth: f64,

    // ── GNSS ──
    pub gnss: GnssProcessorConfig,
    /// Local ENU origin (lat [deg], lon [deg], height [m]); from the first fix when unset
    pub gnss_origin_lla: Option<[f64; 3]>,
    /// GNSS antenna position in the body frame [m]
    pub antenna_lever_arm: Vector3<f64>,
    pub pseudorange_std: f64,
    pub range_rate_std: f64,

    // ── Mocap ──
    /// Mocap marker frame expressed in the body frame
    pub body_to_mocap: Pose,

    // ── Solver ──
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
    pub initial_damping: f64,
    /// Huber threshold (whitened units) for GNSS and image residuals; none disables it
    pub huber_threshold: Option<f64>,

    // ── Noise weighting ──
    pub accel_bias_walk: f64,
    pub gyro_bias_walk: f64,
    pub clock_bias_walk: f64,
    pub clock_drift_walk: f64,
    pub zero_velocity_std: f64,

    // ── First-node prior ──
    pub prior_position_std: f64,
    pub prior_attitude_std: f64,
    pub prior_velocity_std: f64,
    pub prior_accel_bias_std: f64,
    pub prior_gyro_bias_std: f64,
    pub prior_clock_bias_std: f64,
    pub prior_clock_drift_std: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            time_tolerance: 1e-4,
            max_window_nodes: 10,
            integration: IntegrationScheme::Midpoint,
            max_buffered_events: 1024,
            min_feature_count: 20,
            min_parallax: 15.0,
            camera: CameraConfig::default(),
            default_inverse_depth: 0.2,
            gnss: GnssProcessorConfig::default(),
            gnss_origin_lla: None,
            antenna_lever_arm: Vector3::zeros(),
            pseudorange_std: 3.0,
            range_rate_std: 0.1,
            body_to_mocap: Pose::identity(),
            max_iterations: 10,
            convergence_tolerance: 1e-6,
            initial_damping: 1e-4,
            huber_threshold: None,
            accel_bias_walk: 0.003,
            gyro_bias_walk: 0.001,
            clock_bias_walk: 1.0,
            clock_drift_walk: 0.1,
            zero_velocity_std: 1e-3,
            prior_position_std: 1e-3,
            prior_attitude_std: 1e-2,
            prior_velocity_std: 1.0,
            prior_accel_bias_std: 0.1,
            prior_gyro_bias_std: 0.01,
            prior_clock_bias_std: 1e5,
            prior_clock_drift_std: 1e2,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> FusionResult<()> {
        let positive = [
            ("time_tolerance", self.time_tolerance),
            ("default_inverse_depth", self.default_inverse_depth),
            ("camera.fx", self.camera.fx),
            ("camera.fy", self.camera.fy),
            ("gnss.ephemeris_timeout", self.gnss.ephemeris_timeout),
            ("gnss.max_ephemeris_age", self.gnss.max_ephemeris_age),
            ("pseudorange_std", self.pseudorange_std),
            ("range_rate_std", self.range_rate_std),
            ("convergence_tolerance", self.convergence_tolerance),
            ("initial_damping", self.initial_damping),
            ("accel_bias_walk", self.accel_bias_walk),
            ("gyro_bias_walk", self.gyro_bias_walk),
            ("clock_bias_walk", self.clock_bias_walk),
            ("clock_drift_walk", self.clock_drift_walk),
            ("zero_velocity_std", self.zero_velocity_std),
            ("prior_position_std", self.prior_position_std),
            ("prior_attitude_std", self.prior_attitude_std),
            ("prior_velocity_std", self.prior_velocity_std),
            ("prior_accel_bias_std", self.prior_accel_bias_std),
            ("prior_gyro_bias_std", self.prior_gyro_bias_std),
            ("prior_clock_bias_std", self.prior_clock_bias_std),
            ("prior_clock_drift_std", self.prior_clock_drift_std),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(FusionError::InvalidConfig(format!(
                    "{name} must be positive and finite, got {value}"
                )));
            }
        }
        if !(self.min_parallax.is_finite() && self.min_parallax >= 0.0) {
            return Err(FusionError::InvalidConfig(format!(
                "min_parallax must be non-negative, got {}",
                self.min_parallax
            )));
        }
        if self.max_window_nodes < 2 {
            return Err(FusionError::InvalidConfig(
                "max_window_nodes must be at least 2".to_string(),
            ));
        }
        if self.max_buffered_events == 0 {
            return Err(FusionError::InvalidConfig(
                "max_buffered_events must be at least 1".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(FusionError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if let Some(k) = self.huber_threshold {
            if !(k.is_finite() && k > 0.0) {
                return Err(FusionError::InvalidConfig(format!(
                    "huber_threshold must be positive, got {k}"
                )));
            }
        }
        Ok(())
    }
}
