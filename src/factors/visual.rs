/// Reprojection factor for anchored inverse-depth landmarks
///
/// A landmark lives in the camera frame of its anchor node as a unit bearing scaled by one
/// over its inverse depth. Each later keyframe that sees the track contributes one of these.
use nalgebra::{Matrix2, Vector2, Vector3};

use super::LandmarkId;
use crate::config::CameraConfig;
use crate::types::sqrt_information;
use crate::window::{NodeId, NodeState};

/// Inverse depths below this are clamped (points effectively at infinity)
const MIN_INVERSE_DEPTH: f64 = 1e-6;

#[derive(Clone, Debug)]
pub struct FeatureFactor {
    pub anchor: NodeId,
    pub observer: NodeId,
    pub landmark: LandmarkId,
    /// Unit bearing in the anchor camera frame
    pub bearing: Vector3<f64>,
    /// Observed pixel in the observer image
    pub pixel: Vector2<f64>,
    pub camera: CameraConfig,
    pub sqrt_info: Matrix2<f64>,
}

impl FeatureFactor {
    pub fn new(
        anchor: NodeId,
        observer: NodeId,
        landmark: LandmarkId,
        bearing: Vector3<f64>,
        pixel: Vector2<f64>,
        pixel_covariance: &Matrix2<f64>,
        camera: CameraConfig,
    ) -> Self {
        Self {
            anchor,
            observer,
            landmark,
            bearing,
            pixel,
            camera,
            sqrt_info: sqrt_information(pixel_covariance).unwrap_or_else(Matrix2::identity),
        }
    }

    /// Landmark position in the world frame
    pub fn world_point(&self, anchor: &NodeState, inverse_depth: f64) -> Vector3<f64> {
        let in_camera = self.bearing / inverse_depth.max(MIN_INVERSE_DEPTH);
        anchor
            .pose
            .compose(&self.camera.body_to_camera)
            .transform_point(&in_camera)
    }

    /// Points behind the observer's image plane contribute nothing
    pub fn residual(
        &self,
        anchor: &NodeState,
        observer: &NodeState,
        inverse_depth: f64,
    ) -> Vector2<f64> {
        let world = self.world_point(anchor, inverse_depth);
        let in_observer = observer
            .pose
            .compose(&self.camera.body_to_camera)
            .inverse()
            .transform_point(&world);
        match self.camera.project(&in_observer) {
            Some(predicted) => self.sqrt_info * (predicted - self.pixel),
            None => Vector2::zeros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pose;
    use nalgebra::UnitQuaternion;

    fn factor_for(point: &Vector3<f64>, anchor: &NodeState, observer: &NodeState) -> (FeatureFactor, f64) {
        let camera = CameraConfig::default();
        let in_anchor = anchor.pose.inverse().transform_point(point);
        let in_observer = observer.pose.inverse().transform_point(point);
        let factor = FeatureFactor::new(
            NodeId(0),
            NodeId(1),
            3,
            in_anchor.normalize(),
            camera.project(&in_observer).unwrap(),
            &Matrix2::identity(),
            camera,
        );
        (factor, 1.0 / in_anchor.norm())
    }

    #[test]
    fn test_residual_zero_at_true_depth() {
        let point = Vector3::new(0.5, -0.3, 6.0);
        let anchor = NodeState::default();
        let observer = NodeState {
            pose: Pose::new(
                Vector3::new(0.4, 0.1, 0.0),
                UnitQuaternion::from_euler_angles(0.0, 0.05, 0.02),
            ),
            ..NodeState::default()
        };
        let (factor, rho) = factor_for(&point, &anchor, &observer);
        assert!(factor.residual(&anchor, &observer, rho).norm() < 1e-9);
        assert!((factor.world_point(&anchor, rho) - point).norm() < 1e-9);
        // Wrong depth shows up as parallax in the second view
        assert!(factor.residual(&anchor, &observer, rho * 2.0).norm() > 1.0);
    }

    #[test]
    fn test_behind_camera_is_ignored() {
        let point = Vector3::new(0.0, 0.0, 5.0);
        let anchor = NodeState::default();
        let (factor, rho) = factor_for(&point, &anchor, &anchor);
        let flipped = NodeState {
            pose: Pose::new(
                Vector3::new(0.0, 0.0, 10.0),
                UnitQuaternion::identity(),
            ),
            ..NodeState::default()
        };
        assert_eq!(factor.residual(&anchor, &flipped, rho), Vector2::zeros());
    }
}
