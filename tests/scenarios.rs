//! End-to-end scenarios driving the estimator through its public API.
//!
//! Tolerances are 3σ envelopes built from the simulated noise: per-sample standard deviations
//! at `IMU_RATE` accumulate as random walks between corrections.

use nalgebra::{UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use sliding_window_fusion::types::{Matrix6, Vector6, G};
use sliding_window_fusion::{
    Estimator, EstimatorConfig, FusionError, FusionEvent, IntegrationScheme, Pose, StateSnapshot,
};

const IMU_RATE: f64 = 100.0;
/// Per-sample standard deviations
const ACCEL_NOISE: f64 = 0.01;
const GYRO_NOISE: f64 = 0.001;

fn imu_covariance() -> Matrix6 {
    let mut d = Vector6::zeros();
    d.fixed_rows_mut::<3>(0).fill(ACCEL_NOISE * ACCEL_NOISE);
    d.fixed_rows_mut::<3>(3).fill(GYRO_NOISE * GYRO_NOISE);
    Matrix6::from_diagonal(&d)
}

fn noisy_imu(rng: &mut ChaCha8Rng, specific_force: Vector3<f64>) -> Vector6 {
    let mut z = Vector6::zeros();
    for i in 0..3 {
        let na: f64 = rng.sample(StandardNormal);
        let ng: f64 = rng.sample(StandardNormal);
        z[i] = specific_force[i] + ACCEL_NOISE * na;
        z[3 + i] = GYRO_NOISE * ng;
    }
    z
}

/// Velocity standard deviation after integrating `span` seconds of accelerometer noise
fn velocity_random_walk(span: f64) -> f64 {
    ACCEL_NOISE * (span / IMU_RATE).sqrt()
}

/// Position standard deviation after double-integrating `span` seconds of accelerometer noise
fn position_random_walk(span: f64) -> f64 {
    ACCEL_NOISE * (1.0 / IMU_RATE).sqrt() * span.powf(1.5) / 3f64.sqrt()
}

/// Attitude standard deviation after integrating `span` seconds of gyro noise
fn attitude_random_walk(span: f64) -> f64 {
    GYRO_NOISE * (span / IMU_RATE).sqrt()
}

fn estimator(max_window_nodes: usize) -> Estimator {
    Estimator::new(EstimatorConfig {
        max_window_nodes,
        ..EstimatorConfig::default()
    })
    .unwrap()
}

fn at(state: &StateSnapshot, t: f64) -> bool {
    (state.t - t).abs() < 1e-9
}

// ============================================================================
// Stationary
// ============================================================================

#[test]
fn test_stationary_with_zero_velocity_updates() {
    const INTERVAL: f64 = 1.0;
    const MID: f64 = 9.5;

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut est = estimator(5);
    let zero_velocity_std = est.config().zero_velocity_std;
    let prior_position_std = est.config().prior_position_std;
    let cov = imu_covariance();

    let mut mid = None;
    for k in 0..=1000 {
        let t = k as f64 / IMU_RATE;
        est.imu_update(t, noisy_imu(&mut rng, Vector3::new(0.0, 0.0, G)), cov)
            .unwrap();
        if k % 100 == 0 {
            est.zero_vel_update(t).unwrap();
        }
        if let Some(state) = est.current_state().filter(|s| at(s, MID)) {
            mid = Some(state);
        }
    }
    est.flush().unwrap();

    // At a correction: the zero-velocity weight plus one interval of random walk
    let node_velocity_std = zero_velocity_std + velocity_random_walk(INTERVAL);
    // The specific-force error left after estimating biases over one interval
    let force_std = velocity_random_walk(INTERVAL) / INTERVAL + G * attitude_random_walk(INTERVAL);
    let half = MID - MID.floor();
    let mid_velocity_std = node_velocity_std + velocity_random_walk(half) + force_std * half;
    // Each interval adds double-integrated noise plus the node velocity uncertainty
    let intervals = (10.0 / INTERVAL) as u32;
    let position_std = prior_position_std
        + f64::from(intervals).sqrt()
            * (position_random_walk(INTERVAL) + zero_velocity_std * INTERVAL);

    let mid = mid.expect("no estimate published mid-interval");
    assert!(
        mid.velocity.norm() < 3.0 * mid_velocity_std,
        "mid-interval velocity {:?} exceeds {}",
        mid.velocity,
        3.0 * mid_velocity_std
    );

    let state = est.current_state().unwrap();
    assert!(at(&state, 10.0));
    assert!(
        state.velocity.norm() < 3.0 * node_velocity_std,
        "velocity {:?} exceeds {}",
        state.velocity,
        3.0 * node_velocity_std
    );
    assert!(
        state.pose.position.norm() < 3.0 * position_std,
        "position {:?} exceeds {}",
        state.pose.position,
        3.0 * position_std
    );
    assert!(est.window().len() <= 5);

    let events = est.drain_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, FusionEvent::MeasurementDropped { .. })));
    let marginalized = events
        .iter()
        .filter(|e| matches!(e, FusionEvent::NodeMarginalized { .. }))
        .count();
    assert_eq!(marginalized, 11 - 5);
}

// ============================================================================
// IMU + motion capture
// ============================================================================

const MOCAP_INTERVAL: f64 = 0.1;
const MOCAP_STD: f64 = 1e-3;
/// Half-way between the last two mocap poses
const MOCAP_MID: f64 = 4.95;

fn acceleration() -> Vector3<f64> {
    Vector3::new(0.2, 0.0, 0.0)
}

fn truth(t: f64) -> (Vector3<f64>, Vector3<f64>) {
    let a = acceleration();
    (0.5 * a * t * t, a * t)
}

struct MocapRun {
    last: StateSnapshot,
    mid: Option<StateSnapshot>,
    nodes: usize,
}

/// 5 s of constant acceleration along x, IMU at 100 Hz and mocap at 10 Hz. `mocap_first`
/// delivers each mocap pose ahead of the IMU sample at the same instant.
fn run_mocap_scenario(scheme: IntegrationScheme, mocap_first: bool) -> MocapRun {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut est = Estimator::new(EstimatorConfig {
        max_window_nodes: 8,
        integration: scheme,
        ..EstimatorConfig::default()
    })
    .unwrap();
    let imu_cov = imu_covariance();
    let mocap_cov = Matrix6::identity() * (MOCAP_STD * MOCAP_STD);
    let specific_force = acceleration() + Vector3::new(0.0, 0.0, G);

    let mut mid = None;
    for k in 0..=500 {
        let t = k as f64 / IMU_RATE;
        let z = noisy_imu(&mut rng, specific_force);
        let mocap = (k % 10 == 0).then(|| {
            let (p, _) = truth(t);
            Pose::new(p, UnitQuaternion::identity())
        });
        if mocap_first {
            if let Some(pose) = mocap {
                est.mocap_update(t, pose, mocap_cov).unwrap();
            }
            est.imu_update(t, z, imu_cov).unwrap();
        } else {
            est.imu_update(t, z, imu_cov).unwrap();
            if let Some(pose) = mocap {
                est.mocap_update(t, pose, mocap_cov).unwrap();
            }
        }
        if let Some(state) = est.current_state().filter(|s| at(s, MOCAP_MID)) {
            mid = Some((*state).clone());
        }
    }
    est.flush().unwrap();
    MocapRun {
        last: (*est.current_state().unwrap()).clone(),
        mid,
        nodes: est.window().len(),
    }
}

#[test]
fn test_mocap_tracks_constant_acceleration() {
    // Velocity is pinned by differencing two poses plus one interval of random walk
    let node_velocity_std =
        2f64.sqrt() * MOCAP_STD / MOCAP_INTERVAL + velocity_random_walk(MOCAP_INTERVAL);
    let h = MOCAP_MID - (MOCAP_MID / MOCAP_INTERVAL).floor() * MOCAP_INTERVAL;
    let mid_position_std = MOCAP_STD + node_velocity_std * h + position_random_walk(h);
    let mid_velocity_std = node_velocity_std + velocity_random_walk(h);

    for scheme in [IntegrationScheme::Euler, IntegrationScheme::Midpoint] {
        let run = run_mocap_scenario(scheme, false);
        assert_eq!(run.nodes, 8);

        let (p, v) = truth(5.0);
        let state = &run.last;
        assert!(
            (state.pose.position - p).norm() < 3.0 * MOCAP_STD,
            "{scheme:?} position {:?}",
            state.pose.position
        );
        assert!(
            (state.velocity - v).norm() < 3.0 * node_velocity_std,
            "{scheme:?} velocity {:?}",
            state.velocity
        );
        assert!(state.pose.attitude.angle() < 3.0 * MOCAP_STD);

        let mid = run.mid.expect("no estimate published between poses");
        let (p, v) = truth(MOCAP_MID);
        assert!(
            (mid.pose.position - p).norm() < 3.0 * mid_position_std,
            "{scheme:?} mid-interval position {:?}",
            mid.pose.position
        );
        assert!(
            (mid.velocity - v).norm() < 3.0 * mid_velocity_std,
            "{scheme:?} mid-interval velocity {:?}",
            mid.velocity
        );
    }
}

#[test]
fn test_replay_is_deterministic() {
    let a = run_mocap_scenario(IntegrationScheme::Midpoint, false);
    let b = run_mocap_scenario(IntegrationScheme::Midpoint, false);
    assert_eq!(a.last, b.last);
    assert_eq!(a.mid, b.mid);
}

#[test]
fn test_arrival_order_within_an_instant_is_irrelevant() {
    let a = run_mocap_scenario(IntegrationScheme::Midpoint, false);
    let b = run_mocap_scenario(IntegrationScheme::Midpoint, true);
    assert_eq!(a.last, b.last);
}

// ============================================================================
// Rejection
// ============================================================================

#[test]
fn test_late_measurement_rejected_and_run_continues() {
    let mut est = estimator(10);
    let cov = imu_covariance();
    let still = Vector6::new(0.0, 0.0, G, 0.0, 0.0, 0.0);

    for k in 0..=200 {
        let t = k as f64 / IMU_RATE;
        est.imu_update(t, still, cov).unwrap();
        if k % 50 == 0 {
            est.zero_vel_update(t).unwrap();
        }
        if k == 120 {
            let err = est.zero_vel_update(0.5).unwrap_err();
            assert!(matches!(err, FusionError::OutOfOrderMeasurement { .. }));
        }
    }
    est.flush().unwrap();
    assert_eq!(est.window().len(), 5);
    assert!(est.current_state().unwrap().velocity.norm() < 1e-3);
}
