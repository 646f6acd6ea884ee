/// Factors of the sliding-window graph
///
/// Every factor exposes a whitened residual over the current estimates of the variables it
/// touches. Jacobians are taken numerically (central differences on the error-state
/// manifold), so a new factor only has to say how to predict its measurement.
pub mod gnss;
pub mod imu_preintegration;
pub mod mocap;
pub mod motion;
pub mod prior;
pub mod visual;

use nalgebra::{DMatrix, DVector};

use crate::types::{NodeVec, NODE_DIM};
use crate::window::{NodeId, NodeState};

pub use gnss::GnssFactor;
pub use imu_preintegration::{ImuFactor, ImuPropagator, PreintegratedImuMeasurements};
pub use mocap::MocapFactor;
pub use motion::{BiasWalkFactor, ClockWalkFactor, ZeroVelocityFactor};
pub use prior::{MarginalPrior, PriorFactor};
pub use visual::FeatureFactor;

/// Feature track id; one landmark per track while its anchor stays in the window
pub type LandmarkId = u64;

/// Central-difference step on the error state
const JACOBIAN_STEP: f64 = 1e-6;

/// A variable of the optimization problem
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VarKey {
    Node(NodeId),
    Landmark(LandmarkId),
}

impl VarKey {
    pub fn dim(&self) -> usize {
        match self {
            VarKey::Node(_) => NODE_DIM,
            VarKey::Landmark(_) => 1,
        }
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            VarKey::Node(id) => Some(*id),
            VarKey::Landmark(_) => None,
        }
    }

    pub fn as_landmark(&self) -> Option<LandmarkId> {
        match self {
            VarKey::Landmark(id) => Some(*id),
            VarKey::Node(_) => None,
        }
    }
}

/// Estimates handed to a factor: node states then landmark inverse depths, in the order of
/// [`Factor::variables`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Values {
    pub nodes: Vec<NodeState>,
    pub landmarks: Vec<f64>,
}

impl Values {
    pub fn dim(&self) -> usize {
        self.nodes.len() * NODE_DIM + self.landmarks.len()
    }

    /// Copy with error-state coordinate `col` moved by `h`
    pub fn perturbed(&self, col: usize, h: f64) -> Values {
        let mut out = self.clone();
        let node_dims = self.nodes.len() * NODE_DIM;
        if col < node_dims {
            let mut delta = NodeVec::zeros();
            delta[col % NODE_DIM] = h;
            let k = col / NODE_DIM;
            out.nodes[k] = self.nodes[k].boxplus(&delta);
        } else {
            out.landmarks[col - node_dims] += h;
        }
        out
    }

    /// Error state taking `reference` to `self`, stacked in variable order
    pub fn boxminus(&self, reference: &Values) -> DVector<f64> {
        let mut out = DVector::zeros(self.dim());
        for (k, (node, base)) in self.nodes.iter().zip(&reference.nodes).enumerate() {
            out.rows_mut(k * NODE_DIM, NODE_DIM)
                .copy_from(&node.boxminus(base));
        }
        let offset = self.nodes.len() * NODE_DIM;
        for (k, (rho, base)) in self.landmarks.iter().zip(&reference.landmarks).enumerate() {
            out[offset + k] = rho - base;
        }
        out
    }
}

/// Whitened residual and Jacobian at one linearization point
#[derive(Clone, Debug)]
pub struct Linearization {
    pub residual: DVector<f64>,
    pub jacobian: DMatrix<f64>,
    pub cost: f64,
}

#[derive(Clone, Debug)]
pub enum Factor {
    /// IMU preintegration between consecutive nodes
    Imu(ImuFactor),
    /// Bias random walk between consecutive nodes
    BiasWalk(BiasWalkFactor),
    /// Receiver clock bias/drift random walk between consecutive nodes
    ClockWalk(ClockWalkFactor),
    Mocap(MocapFactor),
    Gnss(GnssFactor),
    ZeroVelocity(ZeroVelocityFactor),
    Feature(FeatureFactor),
    /// Initial prior anchoring the first node
    Prior(PriorFactor),
    /// Dense prior left behind by marginalization
    Marginal(MarginalPrior),
}

impl Factor {
    pub fn name(&self) -> &'static str {
        match self {
            Factor::Imu(_) => "imu",
            Factor::BiasWalk(_) => "bias-walk",
            Factor::ClockWalk(_) => "clock-walk",
            Factor::Mocap(_) => "mocap",
            Factor::Gnss(_) => "gnss",
            Factor::ZeroVelocity(_) => "zero-velocity",
            Factor::Feature(_) => "feature",
            Factor::Prior(_) => "prior",
            Factor::Marginal(_) => "marginal",
        }
    }

    /// Propagation factors link nodes without making them observable
    pub fn is_propagation(&self) -> bool {
        matches!(
            self,
            Factor::Imu(_) | Factor::BiasWalk(_) | Factor::ClockWalk(_)
        )
    }

    /// Outlier-prone factors get the robust loss when one is configured
    pub fn is_robust(&self) -> bool {
        matches!(self, Factor::Gnss(_) | Factor::Feature(_))
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        match self {
            Factor::Imu(f) => vec![f.from, f.to],
            Factor::BiasWalk(f) => vec![f.from, f.to],
            Factor::ClockWalk(f) => vec![f.from, f.to],
            Factor::Mocap(f) => vec![f.node],
            Factor::Gnss(f) => vec![f.node],
            Factor::ZeroVelocity(f) => vec![f.node],
            Factor::Feature(f) => vec![f.anchor, f.observer],
            Factor::Prior(f) => vec![f.node],
            Factor::Marginal(f) => f.nodes.clone(),
        }
    }

    pub fn landmarks(&self) -> Vec<LandmarkId> {
        match self {
            Factor::Feature(f) => vec![f.landmark],
            Factor::Marginal(f) => f.landmarks.clone(),
            _ => Vec::new(),
        }
    }

    pub fn variables(&self) -> Vec<VarKey> {
        self.nodes()
            .into_iter()
            .map(VarKey::Node)
            .chain(self.landmarks().into_iter().map(VarKey::Landmark))
            .collect()
    }

    /// Whitened residual at `values`
    pub fn residual(&self, values: &Values) -> DVector<f64> {
        let n = &values.nodes;
        match self {
            Factor::Imu(f) => to_dynamic(f.residual(&n[0], &n[1]).as_slice()),
            Factor::BiasWalk(f) => to_dynamic(f.residual(&n[0], &n[1]).as_slice()),
            Factor::ClockWalk(f) => to_dynamic(f.residual(&n[0], &n[1]).as_slice()),
            Factor::Mocap(f) => to_dynamic(f.residual(&n[0]).as_slice()),
            Factor::Gnss(f) => to_dynamic(f.residual(&n[0]).as_slice()),
            Factor::ZeroVelocity(f) => to_dynamic(f.residual(&n[0]).as_slice()),
            Factor::Feature(f) => to_dynamic(f.residual(&n[0], &n[1], values.landmarks[0]).as_slice()),
            Factor::Prior(f) => to_dynamic(f.residual(&n[0]).as_slice()),
            Factor::Marginal(f) => f.residual(values),
        }
    }

    pub fn cost(&self, values: &Values, huber: Option<f64>) -> f64 {
        let r = self.residual(values);
        match self.huber(huber) {
            Some(k) => 0.5 * huber_rho(r.norm_squared(), k),
            None => 0.5 * r.norm_squared(),
        }
    }

    /// Residual and numeric Jacobian, reweighted when the robust loss applies
    pub fn linearize(&self, values: &Values, huber: Option<f64>) -> Linearization {
        let mut residual = self.residual(values);
        let cols = values.dim();
        let mut jacobian = DMatrix::zeros(residual.len(), cols);
        for col in 0..cols {
            let plus = self.residual(&values.perturbed(col, JACOBIAN_STEP));
            let minus = self.residual(&values.perturbed(col, -JACOBIAN_STEP));
            jacobian.set_column(col, &((plus - minus) / (2.0 * JACOBIAN_STEP)));
        }

        let s = residual.norm_squared();
        let cost = match self.huber(huber) {
            Some(k) => {
                let e = s.sqrt();
                if e > k {
                    let w = (k / e).sqrt();
                    residual *= w;
                    jacobian *= w;
                }
                0.5 * huber_rho(s, k)
            }
            None => 0.5 * s,
        };
        Linearization {
            residual,
            jacobian,
            cost,
        }
    }

    fn huber(&self, huber: Option<f64>) -> Option<f64> {
        huber.filter(|_| self.is_robust())
    }
}

/// Huber loss on a squared residual norm `s`
fn huber_rho(s: f64, k: f64) -> f64 {
    if s <= k * k {
        s
    } else {
        2.0 * k * s.sqrt() - k * k
    }
}

fn to_dynamic(slice: &[f64]) -> DVector<f64> {
    DVector::from_column_slice(slice)
}
