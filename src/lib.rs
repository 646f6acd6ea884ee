//! Sliding-window multi-sensor fusion
//!
//! IMU, motion capture, zero-velocity, camera feature tracks and raw GNSS pseudorange/Doppler
//! are fused into a bounded window of keyframe states, optimized jointly and marginalized
//! as the window slides.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod estimator;
pub mod factors;
pub mod gnss;
pub mod keyframe;
pub mod measurement;
pub mod solver;
pub mod time_order;
pub mod types;
pub mod window;

pub use config::{CameraConfig, EstimatorConfig, IntegrationScheme};
pub use error::{FusionError, FusionResult};
pub use estimator::{Estimator, FusionEvent, IngestStatus, StateSnapshot};
pub use gnss::{Ephemeris, GnssObservation, GnssTime, SatelliteId};
pub use measurement::{
    FeatureTrack, ImageFrame, ImuSample, Measurement, MeasurementKind, MocapPose, Payload,
};
pub use solver::SolveReport;
pub use types::Pose;
pub use window::{NodeId, NodeState, NodeSummary};
