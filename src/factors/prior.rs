/// Gaussian priors: the diagonal prior that anchors the first node, and the dense prior
/// produced by marginalization.
use nalgebra::{DMatrix, DVector};

use super::{LandmarkId, Values};
use crate::types::NodeVec;
use crate::window::{NodeId, NodeState};

#[derive(Clone, Debug)]
pub struct PriorFactor {
    pub node: NodeId,
    pub mean: NodeState,
    /// 1/σ per error-state coordinate
    weights: NodeVec,
}

impl PriorFactor {
    pub fn new(node: NodeId, mean: NodeState, std: &NodeVec) -> Self {
        Self {
            node,
            mean,
            weights: std.map(|s| 1.0 / s),
        }
    }

    pub fn residual(&self, state: &NodeState) -> NodeVec {
        state.boxminus(&self.mean).component_mul(&self.weights)
    }
}

/// `r(x) = S (x ⊟ x0) + r0`, with `SᵀS` and `Sᵀr0` the Schur-complemented information
/// and gradient at the linearization point `x0`
#[derive(Clone, Debug)]
pub struct MarginalPrior {
    pub nodes: Vec<NodeId>,
    pub landmarks: Vec<LandmarkId>,
    pub linearization: Values,
    pub sqrt_info: DMatrix<f64>,
    pub r0: DVector<f64>,
}

impl MarginalPrior {
    pub fn rank(&self) -> usize {
        self.sqrt_info.nrows()
    }

    pub fn residual(&self, values: &Values) -> DVector<f64> {
        &self.sqrt_info * values.boxminus(&self.linearization) + &self.r0
    }
}
