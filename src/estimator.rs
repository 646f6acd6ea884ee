//! Estimation engine
//!
//! Single-writer: every ingestion call runs to completion on the caller's thread, and the
//! published estimate is an immutable snapshot readers can hold on to while the next call
//! replaces it.
//!
//! Lifecycle of one measurement:
//! 1. Boundary checks (finite values, PD covariances, time order). Failures leave all state
//!    untouched.
//! 2. Holdback queue until settled, then dispatch in tolerant time order.
//! 3. IMU samples extend the running preintegration. Corrections find or create their node,
//!    add factors, marginalize past capacity, and re-solve.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector3};
use serde::Serialize;

use crate::config::EstimatorConfig;
use crate::dispatch::DispatchQueue;
use crate::error::{FusionError, FusionResult};
use crate::factors::{
    BiasWalkFactor, ClockWalkFactor, Factor, FeatureFactor, GnssFactor, ImuFactor, ImuPropagator,
    MocapFactor, PriorFactor, ZeroVelocityFactor,
};
use crate::gnss::positioning::MIN_SATELLITES;
use crate::gnss::{
    point_position, DroppedObservation, Ephemeris, GnssObservation, GnssProcessor, GnssTime,
    LocalFrame, ResolvedObservation, SatelliteId,
};
use crate::keyframe::{KeyframeDecision, KeyframeSelector};
use crate::measurement::{ImageFrame, ImuSample, Measurement, MeasurementKind, MocapPose, Payload};
use crate::solver::{solve, SolveReport, SolverSettings};
use crate::time_order::{eq, lt};
use crate::types::{Matrix6, NodeVec, Pose, Vector6};
use crate::window::{Landmark, NodeId, NodeState, NodeSummary, StateWindow};

// ─── Results and events ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestStatus {
    /// Accepted and already applied
    Dispatched,
    /// Accepted; held back until later arrivals settle its instant
    Deferred,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    Initialized { node: NodeId, t: f64, from_mocap: bool },
    NodeCreated { node: NodeId, t: f64 },
    NodeMarginalized { node: NodeId, t: f64, folded_factors: usize, prior_rank: usize },
    GnssOriginInitialized { origin_ecef: Vector3<f64>, clock_bias: f64 },
    EphemerisIgnored { sat: SatelliteId },
    SatelliteDropped { node: NodeId, sat: SatelliteId, reason: FusionError },
    KeyframeSkipped { t: f64, features: usize },
    MeasurementDropped { t: f64, kind: MeasurementKind, reason: FusionError },
    Optimized(SolveReport),
}

// ─── Published estimate ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateSnapshot {
    /// Seconds since the session epoch
    pub t: f64,
    /// Latest window node the estimate is propagated from
    pub node: NodeId,
    pub pose: Pose,
    pub velocity: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    /// [m]
    pub clock_bias: f64,
    /// [m/s]
    pub clock_drift: f64,
    /// Last solve stopped at the iteration cap
    pub degraded: bool,
}

// ─── Estimator ───────────────────────────────────────────────────────────────

pub struct Estimator {
    config: EstimatorConfig,
    settings: SolverSettings,
    window: StateWindow,
    gnss: GnssProcessor,
    keyframes: KeyframeSelector,
    queue: DispatchQueue,
    propagator: ImuPropagator,

    /// GNSS time at session t = 0, fixed by the first GNSS epoch
    session_epoch: Option<GnssTime>,
    frame: Option<LocalFrame>,
    /// Resolved observations waiting for the local frame to exist
    awaiting_origin: Vec<ResolvedObservation>,

    /// Newest accepted timestamp
    newest: Option<f64>,
    published: Option<Arc<StateSnapshot>>,
    degraded: bool,
    events: VecDeque<FusionEvent>,
    /// Events discarded because the buffer was full
    events_overflowed: u64,
    poisoned: Option<FusionError>,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> FusionResult<Self> {
        config.validate()?;
        let frame = config.gnss_origin_lla.map(|[lat, lon, h]| {
            LocalFrame::from_lla(&Vector3::new(lat.to_radians(), lon.to_radians(), h))
        });
        Ok(Self {
            settings: SolverSettings::from_config(&config),
            window: StateWindow::new(config.time_tolerance, config.max_window_nodes),
            gnss: GnssProcessor::new(config.gnss.clone()),
            keyframes: KeyframeSelector::new(config.min_feature_count, config.min_parallax),
            queue: DispatchQueue::new(),
            propagator: ImuPropagator::new(config.integration),
            session_epoch: None,
            frame,
            awaiting_origin: Vec::new(),
            newest: None,
            published: None,
            degraded: false,
            events: VecDeque::new(),
            events_overflowed: 0,
            poisoned: None,
            config,
        })
    }

    // ── Ingestion ────────────────────────────────────────────────────────

    pub fn imu_update(
        &mut self,
        t: f64,
        z: Vector6,
        covariance: Matrix6,
    ) -> FusionResult<IngestStatus> {
        self.ingest(Measurement::new(t, Payload::Imu(ImuSample { z, covariance })))
    }

    pub fn zero_vel_update(&mut self, t: f64) -> FusionResult<IngestStatus> {
        self.ingest(Measurement::new(t, Payload::ZeroVelocity))
    }

    pub fn mocap_update(
        &mut self,
        t: f64,
        pose: Pose,
        covariance: Matrix6,
    ) -> FusionResult<IngestStatus> {
        self.ingest(Measurement::new(
            t,
            Payload::Mocap(MocapPose { pose, covariance }),
        ))
    }

    pub fn image_update(&mut self, t: f64, image: ImageFrame) -> FusionResult<IngestStatus> {
        self.ingest(Measurement::new(t, Payload::Image(image)))
    }

    /// One receiver epoch. Its session time is derived from the GNSS receive time; the first
    /// epoch of a session fixes the mapping.
    pub fn gnss_observation_epoch(
        &mut self,
        observations: Vec<GnssObservation>,
    ) -> FusionResult<IngestStatus> {
        let epoch = observations
            .first()
            .map(|o| o.time)
            .ok_or_else(|| FusionError::InvalidMeasurement("empty GNSS epoch".to_string()))?;
        let anchor = self
            .session_epoch
            .unwrap_or_else(|| epoch - self.newest.unwrap_or(0.0));
        let t = epoch - anchor;
        self.accept(Measurement::new(t, Payload::Gnss(observations)), Some(anchor))
    }

    /// Broadcast ephemeris, applied immediately. Resolves any buffered observations of its
    /// satellite. A stale or duplicate issue is rejected without changing anything.
    pub fn gnss_ephemeris_update(
        &mut self,
        receipt_time: GnssTime,
        eph: Ephemeris,
    ) -> FusionResult<()> {
        self.ensure_healthy()?;
        let sat = eph.sat;
        let outcome = match self.gnss.ingest_ephemeris(receipt_time, eph) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::debug!("ignoring ephemeris: {err}");
                self.record(FusionEvent::EphemerisIgnored { sat });
                return Err(err);
            }
        };
        self.record_dropped(outcome.dropped);
        let result = self.apply_resolved(outcome.resolved);
        self.guard(result)
    }

    /// Generic entry point for pre-built measurements
    pub fn ingest(&mut self, measurement: Measurement) -> FusionResult<IngestStatus> {
        if let Payload::Gnss(observations) = measurement.payload {
            return self.gnss_observation_epoch(observations);
        }
        self.accept(measurement, None)
    }

    /// Dispatch everything still held back
    pub fn flush(&mut self) -> FusionResult<()> {
        self.ensure_healthy()?;
        let pending = self.queue.drain(self.config.time_tolerance);
        let result = self.dispatch_all(pending);
        self.guard(result)
    }

    /// Re-solve the window now; `SolverDivergence` when the iteration cap is hit (the
    /// best iterate is still published, flagged degraded)
    pub fn solve(&mut self) -> FusionResult<SolveReport> {
        self.ensure_healthy()?;
        let result = self.optimize();
        let report = self.guard(result)?;
        if report.converged {
            Ok(report)
        } else {
            Err(FusionError::SolverDivergence {
                iterations: report.iterations,
            })
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Latest estimate; `None` until the first node exists
    pub fn current_state(&self) -> Option<Arc<StateSnapshot>> {
        self.published.clone()
    }

    pub fn window_summary(&self) -> Vec<NodeSummary> {
        self.window.summary()
    }

    pub fn window(&self) -> &StateWindow {
        &self.window
    }

    /// Buffered events, oldest first. At most `max_buffered_events` are kept between drains.
    pub fn drain_events(&mut self) -> Vec<FusionEvent> {
        self.events.drain(..).collect()
    }

    /// Number of events discarded so far because nobody drained them in time
    pub fn events_overflowed(&self) -> u64 {
        self.events_overflowed
    }

    pub fn session_epoch(&self) -> Option<GnssTime> {
        self.session_epoch
    }

    pub fn local_frame(&self) -> Option<&LocalFrame> {
        self.frame.as_ref()
    }

    pub fn pending_measurements(&self) -> usize {
        self.queue.len()
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    // ── Boundary ─────────────────────────────────────────────────────────

    fn accept(
        &mut self,
        measurement: Measurement,
        gnss_anchor: Option<GnssTime>,
    ) -> FusionResult<IngestStatus> {
        self.ensure_healthy()?;
        measurement.validate()?;
        let eps = self.config.time_tolerance;
        if let Some(newest) = self.newest {
            if lt(measurement.t, newest, eps) {
                return Err(FusionError::OutOfOrderMeasurement {
                    time: measurement.t,
                    last: newest,
                });
            }
        }

        if self.session_epoch.is_none() {
            if let Some(anchor) = gnss_anchor {
                log::info!("session epoch fixed at GNSS time {anchor}");
                self.session_epoch = Some(anchor);
            }
        }
        let newest = self.newest.map_or(measurement.t, |n| n.max(measurement.t));
        self.newest = Some(newest);

        let seq = self.queue.push(measurement);
        let ready = self.queue.release(newest, eps);
        let result = self.dispatch_all(ready);
        self.guard(result)?;
        Ok(if self.queue.contains(seq) {
            IngestStatus::Deferred
        } else {
            IngestStatus::Dispatched
        })
    }

    fn ensure_healthy(&self) -> FusionResult<()> {
        match &self.poisoned {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Latch fatal errors; the estimator refuses all later input
    fn guard<T>(&mut self, result: FusionResult<T>) -> FusionResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                log::error!("estimator halted: {err}");
                self.poisoned = Some(err.clone());
            }
        }
        result
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    fn dispatch_all(&mut self, ready: Vec<Measurement>) -> FusionResult<()> {
        for measurement in ready {
            let (t, kind) = (measurement.t, measurement.kind());
            match self.dispatch(measurement) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::warn!("dropping {kind:?} at t={t:.6}: {err}");
                    self.record(FusionEvent::MeasurementDropped {
                        t,
                        kind,
                        reason: err,
                    });
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, measurement: Measurement) -> FusionResult<()> {
        let t = measurement.t;
        match measurement.payload {
            Payload::Imu(sample) => {
                let integrate = !self.window.is_empty();
                self.propagator.push(t, sample, integrate);
                self.publish();
            }
            Payload::ZeroVelocity => {
                let node = self.node_for(t, None)?;
                self.window.add_factor(Factor::ZeroVelocity(ZeroVelocityFactor::new(
                    node,
                    self.config.zero_velocity_std,
                )))?;
                self.optimize()?;
            }
            Payload::Mocap(mocap) => {
                let node = self.node_for(t, Some(&mocap.pose))?;
                self.window.add_factor(Factor::Mocap(MocapFactor::new(
                    node,
                    mocap.pose,
                    &mocap.covariance,
                    self.config.body_to_mocap,
                )))?;
                self.optimize()?;
            }
            Payload::Image(image) => self.process_image(t, &image)?,
            Payload::Gnss(observations) => self.process_gnss_epoch(t, &observations)?,
        }
        self.expire_gnss(t);
        Ok(())
    }

    // ── Nodes ────────────────────────────────────────────────────────────

    /// Node for a correction at `t`: the latest one when it is the same instant, otherwise a
    /// new node linked to the latest by IMU, bias and clock factors.
    fn node_for(&mut self, t: f64, mocap_pose: Option<&Pose>) -> FusionResult<NodeId> {
        let Some(latest) = self.window.latest() else {
            return self.create_first_node(t, mocap_pose);
        };
        if eq(latest.t, t, self.config.time_tolerance) {
            return Ok(latest.id);
        }
        let (prev_id, prev_t, prev_state) = (latest.id, latest.t, latest.state.clone());

        self.propagator.hold_to(t);
        let mut predicted = self.propagator.current().predict(&prev_state);
        let dt = t - prev_t;
        predicted.clock[0] = prev_state.clock[0] + prev_state.clock[1] * dt;

        let (id, created) = self.window.insert_node(t, predicted.clone())?;
        if !created {
            return Ok(id);
        }
        let preint = self
            .propagator
            .take(predicted.accel_bias, predicted.gyro_bias);
        if preint.sum_dt > 0.0 {
            self.window
                .add_factor(Factor::Imu(ImuFactor::new(prev_id, id, preint)))?;
        }
        self.window.add_factor(Factor::BiasWalk(BiasWalkFactor::new(
            prev_id,
            id,
            dt,
            self.config.accel_bias_walk,
            self.config.gyro_bias_walk,
        )))?;
        self.window.add_factor(Factor::ClockWalk(ClockWalkFactor::new(
            prev_id,
            id,
            dt,
            self.config.clock_bias_walk,
            self.config.clock_drift_walk,
        )))?;
        self.record(FusionEvent::NodeCreated { node: id, t });

        self.marginalize_excess()?;
        Ok(id)
    }

    /// First node: attitude from the mocap pose when there is one, otherwise levelled from
    /// the last specific-force sample; anchored by the configured prior.
    fn create_first_node(&mut self, t: f64, mocap_pose: Option<&Pose>) -> FusionResult<NodeId> {
        let pose = match mocap_pose {
            Some(marker) => marker.compose(&self.config.body_to_mocap.inverse()),
            None => Pose::new(
                Vector3::zeros(),
                self.propagator
                    .last_sample()
                    .map(|s| gravity_aligned_attitude(&s.accel()))
                    .unwrap_or_else(UnitQuaternion::identity),
            ),
        };
        let state = NodeState {
            pose,
            ..NodeState::default()
        };
        let (id, _) = self.window.insert_node(t, state.clone())?;
        self.propagator.hold_to(t);
        self.propagator.take(Vector3::zeros(), Vector3::zeros());

        let c = &self.config;
        let mut std = NodeVec::zeros();
        std.fixed_rows_mut::<3>(0).fill(c.prior_position_std);
        std.fixed_rows_mut::<3>(3).fill(c.prior_attitude_std);
        std.fixed_rows_mut::<3>(6).fill(c.prior_velocity_std);
        std.fixed_rows_mut::<3>(9).fill(c.prior_accel_bias_std);
        std.fixed_rows_mut::<3>(12).fill(c.prior_gyro_bias_std);
        std[15] = c.prior_clock_bias_std;
        std[16] = c.prior_clock_drift_std;
        self.window
            .add_factor(Factor::Prior(PriorFactor::new(id, state, &std)))?;

        log::info!("initialized at t={t:.6} (node {id})");
        self.record(FusionEvent::Initialized {
            node: id,
            t,
            from_mocap: mocap_pose.is_some(),
        });
        Ok(id)
    }

    fn marginalize_excess(&mut self) -> FusionResult<()> {
        for report in self.window.enforce_capacity(self.settings.huber)? {
            self.record(FusionEvent::NodeMarginalized {
                node: report.node,
                t: report.t,
                folded_factors: report.folded_factors,
                prior_rank: report.prior_rank,
            });
            let dropped = self.gnss.discard_node(report.node);
            self.record_dropped(dropped);
        }
        let window = &self.window;
        self.awaiting_origin.retain(|r| window.contains(r.node));
        Ok(())
    }

    // ── Images ───────────────────────────────────────────────────────────

    /// A keyframe image gets a node and its observations. A non-keyframe image updates the
    /// current keyframe's track view, so its new tracks count towards the next parallax
    /// decision; its pixels only become factors when it lands on the current node's instant.
    fn process_image(&mut self, t: f64, image: &ImageFrame) -> FusionResult<()> {
        let current = self.window.latest().map(|n| n.id);
        let node = match self.keyframes.evaluate(image, current) {
            KeyframeDecision::NewNode => {
                let node = self.node_for(t, None)?;
                self.keyframes.commit(image);
                Some(node)
            }
            KeyframeDecision::AttachToCurrent => {
                let adopted = self.keyframes.absorb(image);
                if adopted > 0 {
                    log::debug!("image at t={t:.6}: {adopted} new tracks join the keyframe view");
                }
                self.window
                    .latest()
                    .filter(|n| eq(n.t, t, self.config.time_tolerance))
                    .map(|n| n.id)
            }
        };
        let Some(node) = node else {
            log::debug!("image at t={t:.6} is not a keyframe");
            self.record(FusionEvent::KeyframeSkipped {
                t,
                features: image.features.len(),
            });
            return Ok(());
        };

        if self.add_feature_observations(node, image)? > 0 {
            self.optimize()?;
        }
        Ok(())
    }

    /// Reprojection factors for tracks with a landmark elsewhere in the window; new
    /// tracks become landmarks anchored here
    fn add_feature_observations(&mut self, node: NodeId, image: &ImageFrame) -> FusionResult<usize> {
        let camera = &self.config.camera;
        let mut added = 0;
        for track in &image.features {
            let existing = self.window.landmark(track.id).map(|l| (l.anchor, l.bearing));
            match existing {
                Some((anchor, _)) if anchor == node => {}
                Some((anchor, bearing)) => {
                    self.window.add_factor(Factor::Feature(FeatureFactor::new(
                        anchor,
                        node,
                        track.id,
                        bearing,
                        track.pixel,
                        &image.pixel_covariance,
                        camera.clone(),
                    )))?;
                    added += 1;
                }
                None => {
                    let bearing = camera.bearing(&track.pixel);
                    let inverse_depth = track
                        .depth
                        .map_or(self.config.default_inverse_depth, |z| bearing.z / z);
                    self.window.add_landmark(Landmark {
                        id: track.id,
                        anchor: node,
                        bearing,
                        inverse_depth,
                    })?;
                }
            }
        }
        Ok(added)
    }

    // ── GNSS ─────────────────────────────────────────────────────────────

    fn process_gnss_epoch(&mut self, t: f64, observations: &[GnssObservation]) -> FusionResult<()> {
        let node = self.node_for(t, None)?;
        let outcome = self.gnss.ingest_observation_epoch(node, observations);
        if outcome.buffered > 0 {
            log::debug!("{} observations at {node} wait for ephemerides", outcome.buffered);
        }
        self.record_dropped(outcome.dropped);
        self.apply_resolved(outcome.resolved)
    }

    fn apply_resolved(&mut self, resolved: Vec<ResolvedObservation>) -> FusionResult<()> {
        let window = &self.window;
        let mut resolved: Vec<_> = resolved
            .into_iter()
            .filter(|r| window.contains(r.node))
            .collect();
        if resolved.is_empty() {
            return Ok(());
        }

        let frame = match self.frame {
            Some(frame) => frame,
            None => {
                self.awaiting_origin.append(&mut resolved);
                match self.initialize_origin() {
                    Some(frame) => {
                        resolved = std::mem::take(&mut self.awaiting_origin);
                        frame
                    }
                    None => return Ok(()),
                }
            }
        };

        for obs in resolved {
            self.window.add_factor(Factor::Gnss(GnssFactor::new(
                obs,
                frame,
                self.config.antenna_lever_arm,
                self.config.pseudorange_std,
                self.config.range_rate_std,
            )))?;
        }
        self.optimize()?;
        Ok(())
    }

    /// Fix the local frame from a point solution on the newest node with enough satellites
    fn initialize_origin(&mut self) -> Option<LocalFrame> {
        let mut by_node: BTreeMap<NodeId, Vec<ResolvedObservation>> = BTreeMap::new();
        for obs in &self.awaiting_origin {
            by_node.entry(obs.node).or_default().push(obs.clone());
        }
        let (node, fix) = by_node
            .iter()
            .rev()
            .filter(|(_, obs)| obs.len() >= MIN_SATELLITES)
            .find_map(|(node, obs)| point_position(obs).map(|fix| (*node, fix)))?;

        let state = &self.window.node(node)?.state;
        let antenna = state.pose.transform_point(&self.config.antenna_lever_arm);
        let axes = LocalFrame::from_ecef(fix.position_ecef);
        let frame = LocalFrame {
            origin_ecef: fix.position_ecef - axes.enu_to_ecef * antenna,
            enu_to_ecef: axes.enu_to_ecef,
        };

        let ids: Vec<NodeId> = self.window.nodes().map(|n| n.id).collect();
        for id in ids {
            if let Some(n) = self.window.node_mut(id) {
                n.state.clock[0] = fix.clock_bias;
            }
        }
        log::info!(
            "local frame anchored at ECEF {:?} from {node} ({} iterations)",
            frame.origin_ecef.as_slice(),
            fix.iterations
        );
        self.record(FusionEvent::GnssOriginInitialized {
            origin_ecef: frame.origin_ecef,
            clock_bias: fix.clock_bias,
        });
        self.frame = Some(frame);
        Some(frame)
    }

    fn expire_gnss(&mut self, t: f64) {
        if let Some(epoch) = self.session_epoch {
            let dropped = self.gnss.expire(epoch + t);
            self.record_dropped(dropped);
        }
    }

    fn record(&mut self, event: FusionEvent) {
        if self.events.len() >= self.config.max_buffered_events {
            self.events.pop_front();
            self.events_overflowed += 1;
        }
        self.events.push_back(event);
    }

    fn record_dropped(&mut self, dropped: Vec<DroppedObservation>) {
        for d in dropped {
            log::info!("{} at {} dropped: {}", d.sat, d.node, d.reason);
            self.record(FusionEvent::SatelliteDropped {
                node: d.node,
                sat: d.sat,
                reason: d.reason,
            });
        }
    }

    // ── Solve and publish ────────────────────────────────────────────────

    fn optimize(&mut self) -> FusionResult<SolveReport> {
        let report = solve(&mut self.window, &self.settings);
        self.window.check_invariants()?;
        self.degraded = !report.converged;
        self.record(FusionEvent::Optimized(report.clone()));
        self.publish();
        Ok(report)
    }

    fn publish(&mut self) {
        let Some(latest) = self.window.latest() else {
            return;
        };
        let state = self.propagator.current().predict(&latest.state);
        let t = self
            .propagator
            .last_time()
            .map_or(latest.t, |imu_t| imu_t.max(latest.t));
        self.published = Some(Arc::new(StateSnapshot {
            t,
            node: latest.id,
            pose: state.pose,
            velocity: state.velocity,
            accel_bias: state.accel_bias,
            gyro_bias: state.gyro_bias,
            clock_bias: state.clock[0],
            clock_drift: state.clock[1],
            degraded: self.degraded,
        }));
    }
}

/// Attitude that maps a static specific-force reading onto the world up axis (yaw zero)
fn gravity_aligned_attitude(specific_force: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::rotation_between(specific_force, &Vector3::z())
        .unwrap_or_else(UnitQuaternion::identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::ephemeris::tests::sample_ephemeris;
    use crate::gnss::processor::tests::{synthesize, test_receiver_frame};
    use crate::measurement::FeatureTrack;
    use crate::types::{Matrix2, G};

    fn still_imu() -> (Vector6, Matrix6) {
        (
            Vector6::new(0.0, 0.0, G, 0.0, 0.0, 0.0),
            Matrix6::identity() * 1e-4,
        )
    }

    fn estimator(max_nodes: usize) -> Estimator {
        Estimator::new(EstimatorConfig {
            max_window_nodes: max_nodes,
            ..EstimatorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EstimatorConfig {
            time_tolerance: -1.0,
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            Estimator::new(config),
            Err(FusionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_out_of_order_leaves_state_untouched() {
        let mut est = estimator(10);
        let (z, cov) = still_imu();
        for k in 0..=20 {
            est.imu_update(k as f64 * 0.01, z, cov).unwrap();
        }
        est.zero_vel_update(0.1).unwrap();
        est.imu_update(0.21, z, cov).unwrap();
        let summary = est.window_summary();
        let state = est.current_state();

        let err = est.zero_vel_update(0.05).unwrap_err();
        assert!(matches!(err, FusionError::OutOfOrderMeasurement { .. }));
        assert!(!err.is_fatal());
        assert_eq!(est.window_summary(), summary);
        assert_eq!(est.current_state(), state);
    }

    #[test]
    fn test_invalid_measurement_rejected() {
        let mut est = estimator(10);
        let (mut z, cov) = still_imu();
        z[0] = f64::NAN;
        assert!(matches!(
            est.imu_update(0.0, z, cov),
            Err(FusionError::InvalidMeasurement(_))
        ));
        assert_eq!(est.pending_measurements(), 0);
    }

    #[test]
    fn test_corrections_at_same_instant_share_a_node() {
        let mut est = estimator(10);
        let (z, cov) = still_imu();
        est.imu_update(0.0, z, cov).unwrap();
        est.zero_vel_update(1.0).unwrap();
        est.zero_vel_update(1.0 + 0.5e-4).unwrap();
        est.imu_update(1.0, z, cov).unwrap();
        est.flush().unwrap();

        let summary = est.window_summary();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].factor_count, 3);
    }

    #[test]
    fn test_imu_reversed_within_tolerance_integrated_once() {
        let mut est = estimator(10);
        let (z, cov) = still_imu();
        est.imu_update(0.0, z, cov).unwrap();
        est.zero_vel_update(0.0).unwrap();
        est.imu_update(0.50008, z, cov).unwrap();
        est.imu_update(0.5, z, cov).unwrap();
        est.imu_update(1.0, z, cov).unwrap();
        est.zero_vel_update(1.0).unwrap();
        est.flush().unwrap();

        let spans: Vec<f64> = est
            .window()
            .factors()
            .filter_map(|(_, f)| match f {
                Factor::Imu(imu) => Some(imu.preintegration.sum_dt),
                _ => None,
            })
            .collect();
        assert_eq!(spans.len(), 1);
        assert!((spans[0] - 1.0).abs() < 1e-12, "span {}", spans[0]);
    }

    #[test]
    fn test_mocap_initializes_pose() {
        let mut est = estimator(10);
        let pose = Pose::new(
            Vector3::new(1.0, 2.0, 0.5),
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.8),
        );
        est.mocap_update(0.0, pose, Matrix6::identity() * 1e-6)
            .unwrap();
        est.flush().unwrap();
        let state = est.current_state().unwrap();
        assert!((state.pose.position - pose.position).norm() < 1e-6);
        assert!(state.pose.attitude.angle_to(&pose.attitude) < 1e-6);
        assert!(!state.degraded);
        assert!(est
            .drain_events()
            .iter()
            .any(|e| matches!(e, FusionEvent::Initialized { from_mocap: true, .. })));
    }

    #[test]
    fn test_gravity_alignment() {
        let tilted = UnitQuaternion::from_euler_angles(0.2, -0.1, 0.0);
        let force = tilted.inverse() * Vector3::new(0.0, 0.0, G);
        let aligned = gravity_aligned_attitude(&force);
        assert!((aligned * force - Vector3::new(0.0, 0.0, G)).norm() < 1e-9);
    }

    #[test]
    fn test_window_capacity_and_marginal_events() {
        let mut est = estimator(4);
        let (z, cov) = still_imu();
        for k in 0..=300 {
            let t = k as f64 * 0.01;
            est.imu_update(t, z, cov).unwrap();
            if k % 50 == 0 {
                est.zero_vel_update(t).unwrap();
            }
        }
        est.flush().unwrap();
        assert!(est.window().len() <= 4);
        assert!(est.window().active_count() <= 4);
        let events = est.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, FusionEvent::NodeMarginalized { .. })));
        est.window().check_invariants().unwrap();
    }

    #[test]
    fn test_undrained_events_stay_bounded() {
        let mut est = Estimator::new(EstimatorConfig {
            max_window_nodes: 5,
            max_buffered_events: 16,
            ..EstimatorConfig::default()
        })
        .unwrap();
        let (z, cov) = still_imu();
        for k in 0..=3000 {
            let t = k as f64 * 0.01;
            est.imu_update(t, z, cov).unwrap();
            if k % 100 == 0 {
                est.zero_vel_update(t).unwrap();
            }
            assert!(est.events.len() <= 16);
        }
        est.flush().unwrap();
        assert!(est.events_overflowed() > 0);

        let events = est.drain_events();
        assert_eq!(events.len(), 16);
        // Newest survive
        assert!(matches!(events.last(), Some(FusionEvent::Optimized(_))));
        assert!(est.drain_events().is_empty());
    }

    #[test]
    fn test_poisoned_estimator_refuses_input() {
        let mut est = estimator(10);
        est.poisoned = Some(FusionError::WindowInvariantViolation("test".into()));
        assert!(est.zero_vel_update(0.0).unwrap_err().is_fatal());
        assert!(est.flush().is_err());
    }

    fn constellation(toe: GnssTime) -> Vec<Ephemeris> {
        (1..=7).map(|sat| sample_ephemeris(sat, toe)).collect()
    }

    #[test]
    fn test_gnss_initializes_frame_and_clock() {
        let toe = GnssTime::from_week_tow(2200, 7200.0);
        let ephs = constellation(toe);
        let rx = test_receiver_frame().origin_ecef;
        let epoch = toe + 50.0;

        let mut est = estimator(10);
        for eph in &ephs {
            est.gnss_ephemeris_update(toe, eph.clone()).unwrap();
        }
        let observations: Vec<_> = ephs
            .iter()
            .map(|e| synthesize(e, epoch, &rx, 1234.5, &Vector3::zeros(), 0.0))
            .collect();
        est.gnss_observation_epoch(observations).unwrap();
        est.flush().unwrap();

        assert_eq!(est.session_epoch(), Some(epoch));
        let frame = est.local_frame().unwrap();
        assert!((frame.origin_ecef - rx).norm() < 0.1);
        let state = est.current_state().unwrap();
        assert!((state.clock_bias - 1234.5).abs() < 0.1);
        assert!(state.pose.position.norm() < 0.1);
        let gnss_factors = est
            .window()
            .factors()
            .filter(|(_, f)| matches!(f, Factor::Gnss(_)))
            .count();
        assert_eq!(gnss_factors, ephs.len());
    }

    #[test]
    fn test_late_ephemeris_resolves_buffered_epoch() {
        let toe = GnssTime::from_week_tow(2200, 7200.0);
        let ephs = constellation(toe);
        let rx = test_receiver_frame().origin_ecef;
        let epoch = toe + 50.0;
        let observations: Vec<_> = ephs
            .iter()
            .map(|e| synthesize(e, epoch, &rx, 0.0, &Vector3::zeros(), 0.0))
            .collect();

        let mut est = estimator(10);
        est.gnss_observation_epoch(observations).unwrap();
        est.flush().unwrap();
        assert!(est.local_frame().is_none());

        for eph in &ephs {
            est.gnss_ephemeris_update(epoch + 5.0, eph.clone()).unwrap();
        }
        assert!(est.local_frame().is_some());
        assert_eq!(
            est.window()
                .factors()
                .filter(|(_, f)| matches!(f, Factor::Gnss(_)))
                .count(),
            ephs.len()
        );
    }

    #[test]
    fn test_missing_ephemeris_times_out() {
        let toe = GnssTime::from_week_tow(2200, 7200.0);
        let eph = sample_ephemeris(3, toe);
        let rx = test_receiver_frame().origin_ecef;
        let obs = synthesize(&eph, toe + 50.0, &rx, 0.0, &Vector3::zeros(), 0.0);

        let mut est = estimator(100);
        est.gnss_observation_epoch(vec![obs]).unwrap();
        est.zero_vel_update(10.0).unwrap();
        est.zero_vel_update(35.0).unwrap();
        est.flush().unwrap();

        let dropped: Vec<_> = est
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                FusionEvent::SatelliteDropped { sat, reason, .. } => Some((sat, reason)),
                _ => None,
            })
            .collect();
        assert_eq!(
            dropped,
            vec![(SatelliteId(3), FusionError::UnresolvedEphemeris(SatelliteId(3)))]
        );
        // A late ephemeris no longer finds anything to resolve
        est.gnss_ephemeris_update(toe + 100.0, eph).unwrap();
        assert!(est
            .window()
            .factors()
            .all(|(_, f)| !matches!(f, Factor::Gnss(_))));
    }

    #[test]
    fn test_stale_ephemeris_is_rejected_without_effect() {
        let toe = GnssTime::from_week_tow(2200, 7200.0);
        let mut est = estimator(10);
        est.gnss_ephemeris_update(toe, sample_ephemeris(5, toe + 7200.0))
            .unwrap();
        let err = est
            .gnss_ephemeris_update(toe, sample_ephemeris(5, toe))
            .unwrap_err();
        assert_eq!(err, FusionError::DuplicateOrStaleEphemeris(SatelliteId(5)));
        assert!(!err.is_fatal());
        assert_eq!(
            est.drain_events(),
            vec![FusionEvent::EphemerisIgnored { sat: SatelliteId(5) }]
        );
    }

    fn image(points: &[Vector3<f64>], camera_x: f64) -> ImageFrame {
        let camera = crate::config::CameraConfig::default();
        ImageFrame {
            features: points
                .iter()
                .enumerate()
                .filter_map(|(id, p)| {
                    let in_camera = p - Vector3::new(camera_x, 0.0, 0.0);
                    camera.project(&in_camera).map(|pixel| FeatureTrack {
                        id: id as u64,
                        pixel,
                        depth: None,
                    })
                })
                .collect(),
            pixel_covariance: Matrix2::identity(),
            new_keyframe_hint: false,
        }
    }

    #[test]
    fn test_keyframes_create_landmarks_and_reprojection_factors() {
        let points: Vec<_> = (0..30)
            .map(|k| {
                let k = k as f64;
                Vector3::new((k % 6.0) - 2.5, (k / 6.0).floor() - 2.0, 5.0 + 0.1 * k)
            })
            .collect();
        let mut est = Estimator::new(EstimatorConfig {
            min_feature_count: 20,
            min_parallax: 15.0,
            ..EstimatorConfig::default()
        })
        .unwrap();
        let mocap_cov = Matrix6::identity() * 1e-6;

        est.mocap_update(0.0, Pose::identity(), mocap_cov).unwrap();
        est.image_update(0.0, image(&points, 0.0)).unwrap();
        // Too little parallax: not a keyframe
        est.image_update(0.5, image(&points, 0.01)).unwrap();
        let moved = Pose::new(Vector3::new(0.5, 0.0, 0.0), UnitQuaternion::identity());
        est.mocap_update(1.0, moved, mocap_cov).unwrap();
        est.image_update(1.0, image(&points, 0.5)).unwrap();
        est.flush().unwrap();

        assert_eq!(est.window().landmarks().count(), points.len());
        let features = est
            .window()
            .factors()
            .filter(|(_, f)| matches!(f, Factor::Feature(_)))
            .count();
        assert_eq!(features, points.len());
        assert!(est
            .drain_events()
            .iter()
            .any(|e| matches!(e, FusionEvent::KeyframeSkipped { .. })));
    }
}
