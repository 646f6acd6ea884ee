/// Motion-capture pose factor
///
/// The mocap system reports the marker frame; the body pose is mapped through the fixed
/// body-to-marker transform before comparing.
use crate::types::{sqrt_information, Matrix6, Pose, Vector6};
use crate::window::{NodeId, NodeState};

#[derive(Clone, Debug)]
pub struct MocapFactor {
    pub node: NodeId,
    pub measured: Pose,
    pub body_to_mocap: Pose,
    sqrt_info: Matrix6,
}

impl MocapFactor {
    /// `covariance` is ordered (position, rotation) and already validated
    pub fn new(node: NodeId, measured: Pose, covariance: &Matrix6, body_to_mocap: Pose) -> Self {
        let sqrt_info = sqrt_information(covariance).unwrap_or_else(Matrix6::identity);
        Self {
            node,
            measured,
            body_to_mocap,
            sqrt_info,
        }
    }

    pub fn residual(&self, state: &NodeState) -> Vector6 {
        let predicted = state.pose.compose(&self.body_to_mocap);
        self.sqrt_info * predicted.boxminus(&self.measured)
    }
}
