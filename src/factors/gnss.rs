/// GNSS pseudorange and range-rate factor
///
/// Attaches to a single node. The antenna (body position plus lever arm) is mapped from the
/// local ENU frame to ECEF and compared against the satellite state evaluated at signal
/// transmission. Receiver clock bias [m] and drift [m/s] come from the node.
use nalgebra::{Matrix2, Vector2, Vector3};

use crate::gnss::{sagnac_range, LocalFrame, ResolvedObservation, SatelliteId, SPEED_OF_LIGHT};
use crate::window::{NodeId, NodeState};

#[derive(Clone, Debug)]
pub struct GnssFactor {
    pub node: NodeId,
    pub sat: SatelliteId,
    pub observation: ResolvedObservation,
    pub frame: LocalFrame,
    /// Antenna position in the body frame [m]
    pub lever_arm: Vector3<f64>,
    sqrt_info: Matrix2<f64>,
}

impl GnssFactor {
    pub fn new(
        observation: ResolvedObservation,
        frame: LocalFrame,
        lever_arm: Vector3<f64>,
        pseudorange_std: f64,
        range_rate_std: f64,
    ) -> Self {
        Self {
            node: observation.node,
            sat: observation.sat,
            observation,
            frame,
            lever_arm,
            sqrt_info: Matrix2::new(1.0 / pseudorange_std, 0.0, 0.0, 1.0 / range_rate_std),
        }
    }

    /// Predicted (pseudorange [m], range rate [m/s]) for a receiver in `state`
    pub fn predict(&self, state: &NodeState) -> Vector2<f64> {
        let sat = &self.observation.satellite;
        let antenna_enu = state.pose.transform_point(&self.lever_arm);
        let receiver = self.frame.point_to_ecef(&antenna_enu);
        let receiver_velocity = self.frame.vector_to_ecef(&state.velocity);

        let range = sagnac_range(&sat.position, &receiver);
        let los = (sat.position - receiver) / (sat.position - receiver).norm();
        let pseudorange = range + state.clock[0] - SPEED_OF_LIGHT * sat.clock_bias;
        let range_rate = los.dot(&(sat.velocity - receiver_velocity)) + state.clock[1]
            - SPEED_OF_LIGHT * sat.clock_drift;
        Vector2::new(pseudorange, range_rate)
    }

    pub fn residual(&self, state: &NodeState) -> Vector2<f64> {
        let measured = Vector2::new(self.observation.pseudorange, self.observation.range_rate);
        self.sqrt_info * (measured - self.predict(state))
    }
}
