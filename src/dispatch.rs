//! Holdback queue that turns arrival order into dispatch order
//!
//! Accepted measurements wait until they are settled (older than the newest arrival by more
//! than 3ε). Settled measurements are released in tolerant time order; measurements at the
//! same instant go propagation first, then by kind, then by raw timestamp, then by arrival.

use crate::measurement::{Measurement, MeasurementClass, MeasurementKind};
use crate::time_order::{eq, order_key, settled, sort_tolerant};

#[derive(Clone, Debug)]
struct Queued {
    seq: u64,
    measurement: Measurement,
}

impl Queued {
    fn rank(&self) -> (MeasurementClass, MeasurementKind, i64, u64) {
        (
            self.measurement.class(),
            self.measurement.kind(),
            order_key(self.measurement.t),
            self.seq,
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct DispatchQueue {
    items: Vec<Queued>,
    next_seq: u64,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queue a measurement; returns its arrival sequence number
    pub fn push(&mut self, measurement: Measurement) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push(Queued { seq, measurement });
        seq
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.items.iter().any(|q| q.seq == seq)
    }

    /// Remove and return everything settled against `newest`, in dispatch order.
    ///
    /// A settled measurement that shares an instant with one still held back waits for it.
    pub fn release(&mut self, newest: f64, eps: f64) -> Vec<Measurement> {
        let earliest_held = self
            .items
            .iter()
            .filter(|q| !settled(q.measurement.t, newest, eps))
            .map(|q| q.measurement.t)
            .fold(f64::INFINITY, f64::min);

        let (mut ready, held): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.items).into_iter().partition(|q| {
                settled(q.measurement.t, newest, eps)
                    && !(earliest_held.is_finite() && eq(q.measurement.t, earliest_held, eps))
            });
        self.items = held;
        sort_tolerant(&mut ready, eps, |q| q.measurement.t, Queued::rank);
        ready.into_iter().map(|q| q.measurement).collect()
    }

    /// Remove and return everything, in dispatch order
    pub fn drain(&mut self, eps: f64) -> Vec<Measurement> {
        let mut all = std::mem::take(&mut self.items);
        sort_tolerant(&mut all, eps, |q| q.measurement.t, Queued::rank);
        all.into_iter().map(|q| q.measurement).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{ImuSample, Payload};
    use crate::types::{Matrix6, Vector6};

    const EPS: f64 = 1e-4;

    fn imu(t: f64) -> Measurement {
        Measurement::new(
            t,
            Payload::Imu(ImuSample {
                z: Vector6::zeros(),
                covariance: Matrix6::identity(),
            }),
        )
    }

    fn kinds(ms: &[Measurement]) -> Vec<MeasurementKind> {
        ms.iter().map(|m| m.kind()).collect()
    }

    #[test]
    fn test_holds_until_settled() {
        let mut queue = DispatchQueue::new();
        queue.push(imu(1.0));
        assert!(queue.release(1.0, EPS).is_empty());
        assert!(queue.release(1.0 + 2.0 * EPS, EPS).is_empty());
        let out = queue.release(1.0 + 4.0 * EPS, EPS);
        assert_eq!(out.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_same_instant_dispatch_order() {
        let mut queue = DispatchQueue::new();
        // Arrival: correction just ahead of the IMU sample at the same instant
        queue.push(Measurement::new(1.0 + EPS / 2.0, Payload::ZeroVelocity));
        queue.push(imu(1.0));
        queue.push(imu(0.5));
        let out = queue.release(2.0, EPS);
        assert_eq!(
            kinds(&out),
            vec![
                MeasurementKind::Imu,
                MeasurementKind::Imu,
                MeasurementKind::ZeroVelocity
            ]
        );
        assert_eq!(out[0].t, 0.5);
    }

    #[test]
    fn test_imu_within_tolerance_keeps_time_order() {
        let mut queue = DispatchQueue::new();
        queue.push(imu(0.5 + 0.8 * EPS));
        queue.push(imu(0.5));
        let out = queue.release(1.0, EPS);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].t, 0.5);
        assert_eq!(out[1].t, 0.5 + 0.8 * EPS);
    }

    #[test]
    fn test_arrival_breaks_remaining_ties() {
        let mut queue = DispatchQueue::new();
        let a = queue.push(Measurement::new(1.0, Payload::ZeroVelocity));
        let b = queue.push(Measurement::new(1.0, Payload::ZeroVelocity));
        assert!(a < b);
        assert!(queue.contains(b));
        let out = queue.drain(EPS);
        assert_eq!(out.len(), 2);
        assert!(!queue.contains(a));
    }

    #[test]
    fn test_settled_waits_for_unsettled_twin() {
        let mut queue = DispatchQueue::new();
        queue.push(Measurement::new(1.0, Payload::ZeroVelocity));
        queue.push(imu(1.0 + 1.5 * EPS));
        // 1.0 is settled against this newest time but its twin is not
        let out = queue.release(1.0 + 3.5 * EPS, EPS);
        assert!(out.is_empty());
        let out = queue.release(1.0 + 10.0 * EPS, EPS);
        assert_eq!(
            kinds(&out),
            vec![MeasurementKind::Imu, MeasurementKind::ZeroVelocity]
        );
    }
}
