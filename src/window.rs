//! Sliding window of state nodes, landmarks and the factors between them
//!
//! Nodes are kept strictly time-ordered. A node is PENDING until some correction factor
//! touches it and ACTIVE from then on; only ACTIVE nodes take part in optimization. When the
//! window grows past its capacity the oldest node is folded into a dense Gaussian prior on
//! its neighbours (Schur complement) and leaves the window. The last few MARGINALIZED nodes
//! are remembered as summaries.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use nalgebra::{DMatrix, DVector, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};
use crate::factors::{Factor, LandmarkId, MarginalPrior, Values, VarKey};
use crate::solver::{assemble, Layout};
use crate::time_order::{eq, gt, le};
use crate::types::{NodeVec, Pose, Vector6, IDX_BA, IDX_BG, IDX_CLK, IDX_POS, IDX_VEL};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactorId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Pending,
    Active,
    Marginalized,
}

/// Full navigation state at one instant
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub pose: Pose,
    pub velocity: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    /// Receiver clock bias [m] and drift [m/s]
    pub clock: Vector2<f64>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            pose: Pose::identity(),
            velocity: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            clock: Vector2::zeros(),
        }
    }
}

impl NodeState {
    /// Apply a 17-dim error-state increment
    pub fn boxplus(&self, delta: &NodeVec) -> NodeState {
        let pose_delta: Vector6 = delta.fixed_rows::<6>(IDX_POS).into_owned();
        NodeState {
            pose: self.pose.boxplus(&pose_delta),
            velocity: self.velocity + delta.fixed_rows::<3>(IDX_VEL),
            accel_bias: self.accel_bias + delta.fixed_rows::<3>(IDX_BA),
            gyro_bias: self.gyro_bias + delta.fixed_rows::<3>(IDX_BG),
            clock: self.clock + delta.fixed_rows::<2>(IDX_CLK),
        }
    }

    /// Error state taking `reference` to `self`
    pub fn boxminus(&self, reference: &NodeState) -> NodeVec {
        let mut out = NodeVec::zeros();
        out.fixed_rows_mut::<6>(IDX_POS)
            .copy_from(&self.pose.boxminus(&reference.pose));
        out.fixed_rows_mut::<3>(IDX_VEL)
            .copy_from(&(self.velocity - reference.velocity));
        out.fixed_rows_mut::<3>(IDX_BA)
            .copy_from(&(self.accel_bias - reference.accel_bias));
        out.fixed_rows_mut::<3>(IDX_BG)
            .copy_from(&(self.gyro_bias - reference.gyro_bias));
        out.fixed_rows_mut::<2>(IDX_CLK)
            .copy_from(&(self.clock - reference.clock));
        out
    }

    pub fn is_finite(&self) -> bool {
        self.pose.is_finite()
            && self.velocity.iter().all(|v| v.is_finite())
            && self.accel_bias.iter().all(|v| v.is_finite())
            && self.gyro_bias.iter().all(|v| v.is_finite())
            && self.clock.iter().all(|v| v.is_finite())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// Seconds since the session epoch
    pub t: f64,
    pub status: NodeStatus,
    pub state: NodeState,
}

/// Point feature parameterized by inverse distance along a unit bearing in the anchor
/// node's camera frame
#[derive(Clone, Debug, PartialEq)]
pub struct Landmark {
    pub id: LandmarkId,
    pub anchor: NodeId,
    pub bearing: Vector3<f64>,
    pub inverse_depth: f64,
}

/// Read-only view of one node for callers outside the estimator
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub t: f64,
    pub status: NodeStatus,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub factor_count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MarginalizationReport {
    pub node: NodeId,
    pub t: f64,
    /// Factors folded into the new prior
    pub folded_factors: usize,
    /// Landmarks removed along with their anchor
    pub dropped_landmarks: usize,
    /// Rank of the new prior (0 when nothing was left to constrain)
    pub prior_rank: usize,
}

/// Eigenvalues below this fraction of the largest are treated as unobservable
const RANK_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Debug)]
pub struct StateWindow {
    eps: f64,
    max_nodes: usize,
    nodes: VecDeque<Node>,
    landmarks: BTreeMap<LandmarkId, Landmark>,
    factors: BTreeMap<FactorId, Factor>,
    next_node: u64,
    next_factor: u64,
    /// Time of the most recently marginalized node
    marginalized_through: Option<f64>,
    /// Summaries of the most recently marginalized nodes, oldest first, at most `max_nodes`
    retired: VecDeque<NodeSummary>,
}

impl StateWindow {
    pub fn new(time_tolerance: f64, max_nodes: usize) -> Self {
        Self {
            eps: time_tolerance,
            max_nodes,
            nodes: VecDeque::new(),
            landmarks: BTreeMap::new(),
            factors: BTreeMap::new(),
            next_node: 0,
            next_factor: 0,
            marginalized_through: None,
            retired: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn latest(&self) -> Option<&Node> {
        self.nodes.back()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Recently marginalized nodes, oldest first
    pub fn marginalized(&self) -> impl Iterator<Item = &NodeSummary> {
        self.retired.iter()
    }

    pub fn active_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Active)
            .count()
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn factors(&self) -> impl Iterator<Item = (&FactorId, &Factor)> {
        self.factors.iter()
    }

    pub fn factor_count(&self) -> usize {
        self.factors.len()
    }

    /// Node at time `t`, created PENDING unless one already exists within tolerance.
    ///
    /// Returns the id and whether it was newly created. Nodes only grow at the newest end;
    /// a time before the latest node (or at or before a marginalized one) is rejected.
    pub fn insert_node(&mut self, t: f64, initial: NodeState) -> FusionResult<(NodeId, bool)> {
        if let Some(existing) = self.nodes.iter().rev().find(|n| eq(n.t, t, self.eps)) {
            return Ok((existing.id, false));
        }
        if let Some(boundary) = self.marginalized_through {
            if le(t, boundary, self.eps) {
                return Err(FusionError::OutOfOrderMeasurement {
                    time: t,
                    last: boundary,
                });
            }
        }
        if let Some(latest) = self.nodes.back() {
            if !gt(t, latest.t, self.eps) {
                return Err(FusionError::OutOfOrderMeasurement {
                    time: t,
                    last: latest.t,
                });
            }
        }

        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.push_back(Node {
            id,
            t,
            status: NodeStatus::Pending,
            state: initial,
        });
        log::debug!("node {id} created at t={t:.6}");
        Ok((id, true))
    }

    pub fn add_landmark(&mut self, landmark: Landmark) -> FusionResult<()> {
        if !self.contains(landmark.anchor) {
            return Err(FusionError::WindowInvariantViolation(format!(
                "landmark {} anchored at {} which is not in the window",
                landmark.id, landmark.anchor
            )));
        }
        self.landmarks.insert(landmark.id, landmark);
        Ok(())
    }

    /// Insert a factor. Any correction factor promotes the nodes it touches to ACTIVE.
    pub fn add_factor(&mut self, factor: Factor) -> FusionResult<FactorId> {
        for node in factor.nodes() {
            if !self.contains(node) {
                return Err(FusionError::WindowInvariantViolation(format!(
                    "{} factor references {node}, which is not in the window",
                    factor.name()
                )));
            }
        }
        for lm in factor.landmarks() {
            if !self.landmarks.contains_key(&lm) {
                return Err(FusionError::WindowInvariantViolation(format!(
                    "{} factor references unknown landmark {lm}",
                    factor.name()
                )));
            }
        }

        if !factor.is_propagation() {
            for id in factor.nodes() {
                if let Some(node) = self.node_mut(id) {
                    node.status = NodeStatus::Active;
                }
            }
        }

        let id = FactorId(self.next_factor);
        self.next_factor += 1;
        self.factors.insert(id, factor);
        Ok(id)
    }

    /// Current estimates for `nodes` followed by `landmarks`, as a factor expects them
    pub fn values(&self, nodes: &[NodeId], landmarks: &[LandmarkId]) -> Option<Values> {
        let nodes = nodes
            .iter()
            .map(|id| self.node(*id).map(|n| n.state.clone()))
            .collect::<Option<Vec<_>>>()?;
        let landmarks = landmarks
            .iter()
            .map(|id| self.landmarks.get(id).map(|l| l.inverse_depth))
            .collect::<Option<Vec<_>>>()?;
        Some(Values { nodes, landmarks })
    }

    /// Write back an updated estimate
    pub fn set_node_state(&mut self, id: NodeId, state: NodeState) {
        if let Some(node) = self.node_mut(id) {
            node.state = state;
        }
    }

    pub fn set_inverse_depth(&mut self, id: LandmarkId, inverse_depth: f64) {
        if let Some(lm) = self.landmarks.get_mut(&id) {
            lm.inverse_depth = inverse_depth;
        }
    }

    pub fn needs_marginalization(&self) -> bool {
        self.nodes.len() > self.max_nodes
    }

    /// Marginalize until the window is back at capacity
    pub fn enforce_capacity(
        &mut self,
        huber: Option<f64>,
    ) -> FusionResult<Vec<MarginalizationReport>> {
        let mut reports = Vec::new();
        while self.needs_marginalization() {
            match self.marginalize(huber)? {
                Some(report) => reports.push(report),
                None => break,
            }
        }
        Ok(reports)
    }

    /// Fold the oldest node, and every landmark anchored at it, into a prior on the
    /// variables they were connected to.
    pub fn marginalize(&mut self, huber: Option<f64>) -> FusionResult<Option<MarginalizationReport>> {
        let Some(oldest) = self.nodes.front() else {
            return Ok(None);
        };
        let (node_id, node_t) = (oldest.id, oldest.t);

        let mut eliminated: BTreeSet<VarKey> = BTreeSet::from([VarKey::Node(node_id)]);
        eliminated.extend(
            self.landmarks
                .values()
                .filter(|l| l.anchor == node_id)
                .map(|l| VarKey::Landmark(l.id)),
        );

        let folded: Vec<FactorId> = self
            .factors
            .iter()
            .filter(|(_, f)| f.variables().iter().any(|k| eliminated.contains(k)))
            .map(|(id, _)| *id)
            .collect();

        let retained: BTreeSet<VarKey> = folded
            .iter()
            .filter_map(|id| self.factors.get(id))
            .flat_map(|f| f.variables())
            .filter(|k| !eliminated.contains(k))
            .collect();

        let prior = if retained.is_empty() {
            None
        } else {
            self.schur_prior(&eliminated, &retained, &folded, huber)?
        };
        let prior_rank = prior.as_ref().map_or(0, |p| p.rank());

        for id in &folded {
            self.factors.remove(id);
        }
        let dropped_landmarks = eliminated
            .iter()
            .filter_map(VarKey::as_landmark)
            .filter(|id| self.landmarks.remove(id).is_some())
            .count();
        if let Some(node) = self.nodes.pop_front() {
            let mut retired = Self::summarize(&node, folded.len());
            retired.status = NodeStatus::Marginalized;
            if self.retired.len() >= self.max_nodes {
                self.retired.pop_front();
            }
            self.retired.push_back(retired);
        }
        self.marginalized_through = Some(node_t);

        if let Some(prior) = prior {
            self.add_factor(Factor::Marginal(prior))?;
        }
        self.check_invariants()?;

        log::debug!(
            "marginalized {node_id} (t={node_t:.6}): {} factors folded, prior rank {prior_rank}",
            folded.len()
        );
        Ok(Some(MarginalizationReport {
            node: node_id,
            t: node_t,
            folded_factors: folded.len(),
            dropped_landmarks,
            prior_rank,
        }))
    }

    fn schur_prior(
        &self,
        eliminated: &BTreeSet<VarKey>,
        retained: &BTreeSet<VarKey>,
        folded: &[FactorId],
        huber: Option<f64>,
    ) -> FusionResult<Option<MarginalPrior>> {
        let ordered: Vec<VarKey> = eliminated.iter().chain(retained.iter()).copied().collect();
        let layout = Layout::new(&ordered);
        let factors: Vec<&Factor> = folded.iter().filter_map(|id| self.factors.get(id)).collect();
        let system = assemble(self, &factors, &layout, huber).ok_or_else(|| {
            FusionError::WindowInvariantViolation(
                "marginalization references a variable outside the window".to_string(),
            )
        })?;

        let m: usize = eliminated.iter().map(|k| k.dim()).sum();
        let n = layout.dim() - m;
        let h = &system.hessian;
        let g = &system.gradient;

        let hmm = h.view((0, 0), (m, m)).into_owned();
        let hmr = h.view((0, m), (m, n)).into_owned();
        let hrr = h.view((m, m), (n, n)).into_owned();
        let gm = g.rows(0, m).into_owned();
        let gr = g.rows(m, n).into_owned();

        let hmm_inv = pseudo_inverse(&hmm);
        let hrm_hmm_inv = hmr.transpose() * &hmm_inv;
        let mut h_prior = hrr - &hrm_hmm_inv * &hmr;
        h_prior = (&h_prior + h_prior.transpose()) * 0.5;
        let g_prior = gr - &hrm_hmm_inv * gm;

        // H = V diag(λ) V^T  ->  S = diag(√λ) V^T,  r0 = diag(1/√λ) V^T g
        let eig = h_prior.symmetric_eigen();
        let max_eig = eig.eigenvalues.iter().cloned().fold(0.0, f64::max);
        if max_eig <= 0.0 {
            return Ok(None);
        }
        let kept: Vec<usize> = (0..n)
            .filter(|&i| eig.eigenvalues[i] > RANK_TOLERANCE * max_eig)
            .collect();
        let mut sqrt_info = DMatrix::zeros(kept.len(), n);
        let mut r0 = DVector::zeros(kept.len());
        for (row, &i) in kept.iter().enumerate() {
            let lambda = eig.eigenvalues[i];
            let v = eig.eigenvectors.column(i);
            sqrt_info
                .row_mut(row)
                .copy_from(&(v.transpose() * lambda.sqrt()));
            r0[row] = v.dot(&g_prior) / lambda.sqrt();
        }

        let nodes: Vec<NodeId> = retained.iter().filter_map(VarKey::as_node).collect();
        let landmarks: Vec<LandmarkId> = retained.iter().filter_map(VarKey::as_landmark).collect();
        let linearization = self.values(&nodes, &landmarks).ok_or_else(|| {
            FusionError::WindowInvariantViolation("retained variable vanished".to_string())
        })?;
        Ok(Some(MarginalPrior {
            nodes,
            landmarks,
            linearization,
            sqrt_info,
            r0,
        }))
    }

    /// Structural checks that must hold between operations
    pub fn check_invariants(&self) -> FusionResult<()> {
        for pair in self.nodes.iter().zip(self.nodes.iter().skip(1)) {
            if !gt(pair.1.t, pair.0.t, self.eps) {
                return Err(FusionError::WindowInvariantViolation(format!(
                    "nodes {} and {} are not strictly time-ordered",
                    pair.0.id, pair.1.id
                )));
            }
        }
        if self
            .nodes
            .iter()
            .any(|n| n.status == NodeStatus::Marginalized)
        {
            return Err(FusionError::WindowInvariantViolation(
                "marginalized node still in the window".to_string(),
            ));
        }
        if let (Some(retired), Some(front)) = (self.retired.back(), self.nodes.front()) {
            if retired.status != NodeStatus::Marginalized || !gt(front.t, retired.t, self.eps) {
                return Err(FusionError::WindowInvariantViolation(format!(
                    "retired node {} overlaps the window",
                    retired.id
                )));
            }
        }
        for factor in self.factors.values() {
            if let Some(missing) = factor.nodes().iter().find(|id| !self.contains(**id)) {
                return Err(FusionError::WindowInvariantViolation(format!(
                    "{} factor references {missing}, which has left the window",
                    factor.name()
                )));
            }
            if let Some(missing) = factor
                .landmarks()
                .iter()
                .find(|id| !self.landmarks.contains_key(*id))
            {
                return Err(FusionError::WindowInvariantViolation(format!(
                    "{} factor references removed landmark {missing}",
                    factor.name()
                )));
            }
        }
        for lm in self.landmarks.values() {
            if !self.contains(lm.anchor) {
                return Err(FusionError::WindowInvariantViolation(format!(
                    "landmark {} outlived its anchor {}",
                    lm.id, lm.anchor
                )));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> Vec<NodeSummary> {
        self.nodes
            .iter()
            .map(|n| {
                let factor_count = self
                    .factors
                    .values()
                    .filter(|f| f.nodes().contains(&n.id))
                    .count();
                Self::summarize(n, factor_count)
            })
            .collect()
    }

    fn summarize(node: &Node, factor_count: usize) -> NodeSummary {
        NodeSummary {
            id: node.id,
            t: node.t,
            status: node.status,
            position: node.state.pose.position,
            velocity: node.state.velocity,
            factor_count,
        }
    }
}

/// Symmetric pseudo-inverse; directions without information are left out
fn pseudo_inverse(m: &DMatrix<f64>) -> DMatrix<f64> {
    let sym = (m + m.transpose()) * 0.5;
    let eig = sym.symmetric_eigen();
    let max_eig = eig.eigenvalues.iter().cloned().fold(0.0, f64::max);
    let inv: DVector<f64> = eig.eigenvalues.map(|l| {
        if max_eig > 0.0 && l > RANK_TOLERANCE * max_eig {
            1.0 / l
        } else {
            0.0
        }
    });
    &eig.eigenvectors * DMatrix::from_diagonal(&inv) * eig.eigenvectors.transpose()
}
