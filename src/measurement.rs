//! Timestamped sensor observations
//!
//! A closed sum type: every kind the estimator understands is listed here and dispatched
//! by pattern match.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};
use crate::gnss::GnssObservation;
use crate::types::{is_positive_definite, Matrix2, Matrix6, Pose, Vector2, Vector6};

/// Measurement kinds in dispatch tie-break order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MeasurementKind {
    Imu,
    ZeroVelocity,
    Mocap,
    Gnss,
    Image,
}

/// Propagation measurements move the state forward; corrections constrain it
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MeasurementClass {
    Propagation,
    Correction,
}

impl MeasurementKind {
    pub fn class(self) -> MeasurementClass {
        match self {
            MeasurementKind::Imu => MeasurementClass::Propagation,
            _ => MeasurementClass::Correction,
        }
    }
}

/// Specific force (0:3) and angular rate (3:6) with their covariance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub z: Vector6,
    pub covariance: Matrix6,
}

impl ImuSample {
    pub fn accel(&self) -> Vector3<f64> {
        self.z.fixed_rows::<3>(0).into_owned()
    }

    pub fn gyro(&self) -> Vector3<f64> {
        self.z.fixed_rows::<3>(3).into_owned()
    }
}

/// Motion-capture pose of the marker frame, covariance ordered (position, rotation)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MocapPose {
    pub pose: Pose,
    pub covariance: Matrix6,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureTrack {
    pub id: u64,
    /// Pixel coordinates (u, v)
    pub pixel: Vector2,
    /// Depth along the optical axis when the front end measured one [m]
    pub depth: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageFrame {
    pub features: Vec<FeatureTrack>,
    pub pixel_covariance: Matrix2,
    /// Front-end keyframe suggestion; advisory only
    pub new_keyframe_hint: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Gnss(Vec<GnssObservation>),
    Imu(ImuSample),
    Mocap(MocapPose),
    Image(ImageFrame),
    ZeroVelocity,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Seconds since the session epoch
    pub t: f64,
    pub payload: Payload,
}

impl Measurement {
    pub fn new(t: f64, payload: Payload) -> Self {
        Self { t, payload }
    }

    pub fn kind(&self) -> MeasurementKind {
        match self.payload {
            Payload::Gnss(_) => MeasurementKind::Gnss,
            Payload::Imu(_) => MeasurementKind::Imu,
            Payload::Mocap(_) => MeasurementKind::Mocap,
            Payload::Image(_) => MeasurementKind::Image,
            Payload::ZeroVelocity => MeasurementKind::ZeroVelocity,
        }
    }

    pub fn class(&self) -> MeasurementClass {
        self.kind().class()
    }

    /// Ingestion-boundary check: finite values and positive-definite covariances
    pub fn validate(&self) -> FusionResult<()> {
        if !self.t.is_finite() {
            return Err(invalid("non-finite timestamp"));
        }
        match &self.payload {
            Payload::Imu(imu) => {
                if imu.z.iter().any(|v| !v.is_finite()) {
                    return Err(invalid("non-finite IMU sample"));
                }
                if !is_positive_definite(&imu.covariance) {
                    return Err(invalid("IMU covariance is not positive definite"));
                }
            }
            Payload::Mocap(mocap) => {
                if !mocap.pose.is_finite() {
                    return Err(invalid("non-finite mocap pose"));
                }
                if !is_positive_definite(&mocap.covariance) {
                    return Err(invalid("mocap covariance is not positive definite"));
                }
            }
            Payload::Image(image) => {
                if !is_positive_definite(&image.pixel_covariance) {
                    return Err(invalid("pixel covariance is not positive definite"));
                }
                let bad_feature = image.features.iter().any(|f| {
                    f.pixel.iter().any(|v| !v.is_finite())
                        || f.depth.is_some_and(|d| !d.is_finite() || d <= 0.0)
                });
                if bad_feature {
                    return Err(invalid("non-finite feature track"));
                }
            }
            Payload::Gnss(observations) => {
                if observations.is_empty() {
                    return Err(invalid("empty GNSS epoch"));
                }
                if observations.iter().any(|o| !o.is_finite()) {
                    return Err(invalid("non-finite GNSS observation"));
                }
            }
            Payload::ZeroVelocity => {}
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> FusionError {
    FusionError::InvalidMeasurement(msg.to_string())
}
