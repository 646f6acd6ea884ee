//! Dense Levenberg-Marquardt over the ACTIVE part of the window
//!
//! Only factors whose nodes are all ACTIVE take part; PENDING nodes keep their propagated
//! estimates until a correction reaches them. A step is kept only when it lowers the total
//! cost, so the window always holds the best iterate seen.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::config::EstimatorConfig;
use crate::factors::{Factor, VarKey};
use crate::types::{NodeVec, NODE_DIM};
use crate::window::{NodeState, NodeStatus, StateWindow};

const MAX_DAMPING_ATTEMPTS: usize = 10;
const MIN_DAMPING: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq)]
pub struct SolverSettings {
    pub max_iterations: usize,
    /// Converged when the largest step component or the relative cost decrease drops below this
    pub tolerance: f64,
    pub initial_damping: f64,
    pub huber: Option<f64>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-6,
            initial_damping: 1e-4,
            huber: None,
        }
    }
}

impl SolverSettings {
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            tolerance: config.convergence_tolerance,
            initial_damping: config.initial_damping,
            huber: config.huber_threshold,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SolveReport {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// False when the iteration cap was hit first; the estimate is then degraded
    pub converged: bool,
}

/// Column offsets of each variable in the stacked error state
#[derive(Clone, Debug)]
pub struct Layout {
    keys: Vec<VarKey>,
    offsets: BTreeMap<VarKey, usize>,
    dim: usize,
}

impl Layout {
    pub fn new(keys: &[VarKey]) -> Self {
        let mut offsets = BTreeMap::new();
        let mut dim = 0;
        for key in keys {
            offsets.insert(*key, dim);
            dim += key.dim();
        }
        Self {
            keys: keys.to_vec(),
            offsets,
            dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn offset(&self, key: &VarKey) -> Option<usize> {
        self.offsets.get(key).copied()
    }
}

/// Normal equations `H = JᵀJ`, `g = Jᵀr` and the cost at the current estimate
#[derive(Clone, Debug)]
pub struct LinearSystem {
    pub hessian: DMatrix<f64>,
    pub gradient: DVector<f64>,
    pub cost: f64,
}

/// Linearize `factors` at the window's estimates. `None` if a factor touches a variable
/// missing from the window or the layout.
pub fn assemble(
    window: &StateWindow,
    factors: &[&Factor],
    layout: &Layout,
    huber: Option<f64>,
) -> Option<LinearSystem> {
    let mut hessian = DMatrix::zeros(layout.dim(), layout.dim());
    let mut gradient = DVector::zeros(layout.dim());
    let mut cost = 0.0;

    for factor in factors {
        let values = window.values(&factor.nodes(), &factor.landmarks())?;
        let lin = factor.linearize(&values, huber);
        cost += lin.cost;

        let mut blocks = Vec::new();
        let mut local = 0;
        for key in factor.variables() {
            blocks.push((local, layout.offset(&key)?, key.dim()));
            local += key.dim();
        }
        let jtj = lin.jacobian.transpose() * &lin.jacobian;
        let jtr = lin.jacobian.transpose() * &lin.residual;
        for &(li, gi, di) in &blocks {
            let mut g = gradient.rows_mut(gi, di);
            g += jtr.rows(li, di);
            for &(lj, gj, dj) in &blocks {
                let mut h = hessian.view_mut((gi, gj), (di, dj));
                h += jtj.view((li, lj), (di, dj));
            }
        }
    }
    Some(LinearSystem {
        hessian,
        gradient,
        cost,
    })
}

fn total_cost(window: &StateWindow, factors: &[&Factor], huber: Option<f64>) -> f64 {
    factors
        .iter()
        .map(|f| match window.values(&f.nodes(), &f.landmarks()) {
            Some(values) => f.cost(&values, huber),
            None => f64::INFINITY,
        })
        .sum()
}

enum Saved {
    Node(NodeState),
    Landmark(f64),
}

fn snapshot(window: &StateWindow, layout: &Layout) -> Vec<(VarKey, Saved)> {
    layout
        .keys
        .iter()
        .filter_map(|key| match key {
            VarKey::Node(id) => window
                .node(*id)
                .map(|n| (*key, Saved::Node(n.state.clone()))),
            VarKey::Landmark(id) => window
                .landmark(*id)
                .map(|l| (*key, Saved::Landmark(l.inverse_depth))),
        })
        .collect()
}

fn restore(window: &mut StateWindow, saved: Vec<(VarKey, Saved)>) {
    for (key, value) in saved {
        match (key, value) {
            (VarKey::Node(id), Saved::Node(state)) => window.set_node_state(id, state),
            (VarKey::Landmark(id), Saved::Landmark(rho)) => window.set_inverse_depth(id, rho),
            _ => {}
        }
    }
}

fn apply(window: &mut StateWindow, layout: &Layout, delta: &DVector<f64>) {
    for key in &layout.keys {
        let Some(offset) = layout.offset(key) else {
            continue;
        };
        match key {
            VarKey::Node(id) => {
                if let Some(node) = window.node(*id) {
                    let step = NodeVec::from_iterator(delta.rows(offset, NODE_DIM).iter().copied());
                    let updated = node.state.boxplus(&step);
                    window.set_node_state(*id, updated);
                }
            }
            VarKey::Landmark(id) => {
                if let Some(lm) = window.landmark(*id) {
                    let updated = lm.inverse_depth + delta[offset];
                    window.set_inverse_depth(*id, updated);
                }
            }
        }
    }
}

/// Factors eligible for optimization: every node they touch is ACTIVE
pub fn active_factors(window: &StateWindow) -> Vec<Factor> {
    window
        .factors()
        .filter(|(_, f)| {
            f.nodes().iter().all(|id| {
                window
                    .node(*id)
                    .is_some_and(|n| n.status == NodeStatus::Active)
            })
        })
        .map(|(_, f)| f.clone())
        .collect()
}

/// Optimize the ACTIVE nodes and the landmarks they observe in place
pub fn solve(window: &mut StateWindow, settings: &SolverSettings) -> SolveReport {
    let factors = active_factors(window);
    let refs: Vec<&Factor> = factors.iter().collect();
    let keys: BTreeSet<VarKey> = factors.iter().flat_map(|f| f.variables()).collect();
    let layout = Layout::new(&keys.into_iter().collect::<Vec<_>>());

    let Some(mut system) = assemble(window, &refs, &layout, settings.huber) else {
        log::error!("solver skipped: a factor references a variable outside the window");
        return SolveReport {
            iterations: 0,
            initial_cost: f64::NAN,
            final_cost: f64::NAN,
            converged: false,
        };
    };

    let initial_cost = system.cost;
    let mut cost = initial_cost;
    let mut lambda = settings.initial_damping;
    let mut iterations = 0;
    let mut converged = layout.dim() == 0;

    while !converged && iterations < settings.max_iterations {
        iterations += 1;
        let mut step = None;
        for _ in 0..MAX_DAMPING_ATTEMPTS {
            let mut damped = system.hessian.clone();
            for i in 0..layout.dim() {
                damped[(i, i)] += lambda;
            }
            let Some(chol) = damped.cholesky() else {
                lambda *= 10.0;
                continue;
            };
            let delta = chol.solve(&(-&system.gradient));
            let saved = snapshot(window, &layout);
            apply(window, &layout, &delta);
            let new_cost = total_cost(window, &refs, settings.huber);
            if new_cost.is_finite() && new_cost < cost {
                step = Some((delta.amax(), cost - new_cost));
                cost = new_cost;
                lambda = (lambda / 10.0).max(MIN_DAMPING);
                break;
            }
            restore(window, saved);
            lambda *= 10.0;
        }

        match step {
            // No damping lowers the cost: already at the minimum to working precision
            None => converged = true,
            Some((step_norm, decrease)) => {
                if step_norm < settings.tolerance
                    || decrease <= settings.tolerance * (cost + decrease).max(settings.tolerance)
                {
                    converged = true;
                } else {
                    match assemble(window, &refs, &layout, settings.huber) {
                        Some(next) => system = next,
                        None => break,
                    }
                }
            }
        }
    }

    if !converged {
        log::warn!(
            "solver hit the iteration cap ({iterations}); cost {initial_cost:.3e} -> {cost:.3e}"
        );
    } else {
        log::trace!("solver converged in {iterations} iterations, cost {cost:.3e}");
    }
    SolveReport {
        iterations,
        initial_cost,
        final_cost: cost,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{PriorFactor, ZeroVelocityFactor};
    use crate::types::Pose;
    use nalgebra::Vector3;

    #[test]
    fn test_solves_linear_problem_exactly() {
        let mut window = StateWindow::new(1e-4, 4);
        let (id, _) = window.insert_node(0.0, NodeState::default()).unwrap();
        let mean = NodeState {
            pose: Pose::new(Vector3::new(1.0, 2.0, 3.0), Default::default()),
            velocity: Vector3::new(0.2, 0.0, 0.0),
            ..NodeState::default()
        };
        window
            .add_factor(Factor::Prior(PriorFactor::new(
                id,
                mean,
                &NodeVec::from_element(1.0),
            )))
            .unwrap();
        window
            .add_factor(Factor::ZeroVelocity(ZeroVelocityFactor::new(id, 1.0)))
            .unwrap();

        let report = solve(&mut window, &SolverSettings::default());
        assert!(report.converged);
        assert!(report.final_cost < report.initial_cost);
        let state = &window.node(id).unwrap().state;
        assert!((state.pose.position - Vector3::new(1.0, 2.0, 3.0)).norm() < 1e-6);
        // Equal weights split the difference
        assert!((state.velocity.x - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_pending_nodes_are_untouched() {
        let mut window = StateWindow::new(1e-4, 4);
        let (a, _) = window.insert_node(0.0, NodeState::default()).unwrap();
        let mut drifting = NodeState::default();
        drifting.velocity.x = 3.0;
        let (b, _) = window.insert_node(1.0, drifting.clone()).unwrap();
        window
            .add_factor(Factor::ZeroVelocity(ZeroVelocityFactor::new(a, 1.0)))
            .unwrap();
        window
            .add_factor(Factor::BiasWalk(crate::factors::BiasWalkFactor::new(
                a, b, 1.0, 0.1, 0.1,
            )))
            .unwrap();

        solve(&mut window, &SolverSettings::default());
        assert_eq!(window.node(b).unwrap().status, NodeStatus::Pending);
        assert_eq!(window.node(b).unwrap().state, drifting);
    }

    #[test]
    fn test_iteration_cap_reports_not_converged() {
        let mut window = StateWindow::new(1e-4, 4);
        let (id, _) = window.insert_node(0.0, NodeState::default()).unwrap();
        let mean = NodeState {
            pose: Pose::new(
                Vector3::zeros(),
                nalgebra::UnitQuaternion::from_euler_angles(0.0, 0.0, 2.5),
            ),
            ..NodeState::default()
        };
        window
            .add_factor(Factor::Prior(PriorFactor::new(
                id,
                mean,
                &NodeVec::from_element(1.0),
            )))
            .unwrap();
        window
            .add_factor(Factor::ZeroVelocity(ZeroVelocityFactor::new(id, 1.0)))
            .unwrap();

        let settings = SolverSettings {
            max_iterations: 1,
            tolerance: 1e-14,
            initial_damping: 1e3,
            huber: None,
        };
        let report = solve(&mut window, &settings);
        assert_eq!(report.iterations, 1);
        assert!(!report.converged);
        assert!(report.final_cost <= report.initial_cost);
    }
}
