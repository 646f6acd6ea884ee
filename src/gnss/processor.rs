//! Ephemeris store and observation resolution
//!
//! Observations wait here until an ephemeris valid at their epoch is known for their
//! satellite. Anything still unresolved after the wait timeout is dropped on its own; the
//! rest of its epoch is unaffected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ephemeris::{Ephemeris, SatelliteState};
use super::time::GnssTime;
use super::{GnssObservation, SatelliteId, LAMBDA_L1, SPEED_OF_LIGHT};
use crate::error::{FusionError, FusionResult};
use crate::window::NodeId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssProcessorConfig {
    /// Longest wait for a matching ephemeris after the observation epoch [s]
    pub ephemeris_timeout: f64,
    /// Largest |t - toe| for which an ephemeris is used [s]
    pub max_ephemeris_age: f64,
    /// Observations below this SNR are discarded [dB-Hz]
    pub min_snr: f64,
}

impl Default for GnssProcessorConfig {
    fn default() -> Self {
        Self {
            ephemeris_timeout: 30.0,
            max_ephemeris_age: 4.0 * 3600.0,
            min_snr: 0.0,
        }
    }
}

/// Observation with the satellite state evaluated at signal transmission time
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedObservation {
    pub node: NodeId,
    pub sat: SatelliteId,
    pub receive_time: GnssTime,
    pub transmit_time: GnssTime,
    pub satellite: SatelliteState,
    /// [m]
    pub pseudorange: f64,
    /// Range rate from Doppler [m/s]
    pub range_rate: f64,
    /// [cycles]
    pub carrier_phase: f64,
    pub snr: f64,
    pub lock_loss: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DroppedObservation {
    pub node: NodeId,
    pub sat: SatelliteId,
    pub reason: FusionError,
}

/// What an ingestion call produced
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EpochOutcome {
    pub resolved: Vec<ResolvedObservation>,
    pub buffered: usize,
    pub dropped: Vec<DroppedObservation>,
}

#[derive(Clone, Debug)]
struct PendingObservation {
    node: NodeId,
    obs: GnssObservation,
}

#[derive(Clone, Debug, Default)]
pub struct GnssProcessor {
    config: GnssProcessorConfig,
    ephemerides: BTreeMap<SatelliteId, Ephemeris>,
    pending: Vec<PendingObservation>,
}

impl GnssProcessor {
    pub fn new(config: GnssProcessorConfig) -> Self {
        Self {
            config,
            ephemerides: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn ephemeris(&self, sat: SatelliteId) -> Option<&Ephemeris> {
        self.ephemerides.get(&sat)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Store a new ephemeris and resolve whatever was waiting on it.
    ///
    /// An older or identical issue for a satellite that already has one is rejected with
    /// `DuplicateOrStaleEphemeris` and changes nothing.
    pub fn ingest_ephemeris(
        &mut self,
        receipt_time: GnssTime,
        eph: Ephemeris,
    ) -> FusionResult<EpochOutcome> {
        validate_ephemeris(&eph)?;
        if let Some(existing) = self.ephemerides.get(&eph.sat) {
            if !eph.supersedes(existing) {
                return Err(FusionError::DuplicateOrStaleEphemeris(eph.sat));
            }
        }
        let sat = eph.sat;
        log::debug!("ephemeris for {sat} (iode {}, toe {})", eph.iode, eph.toe);
        self.ephemerides.insert(sat, eph);

        let mut outcome = EpochOutcome {
            dropped: self.expire(receipt_time),
            ..EpochOutcome::default()
        };

        let mut still_pending = Vec::with_capacity(self.pending.len());
        for pending in std::mem::take(&mut self.pending) {
            match self.usable_ephemeris(&pending.obs) {
                Some(eph) if pending.obs.satellite == sat => {
                    outcome.resolved.push(resolve(eph, pending.node, &pending.obs));
                }
                _ => still_pending.push(pending),
            }
        }
        self.pending = still_pending;
        outcome.buffered = self.pending.len();
        Ok(outcome)
    }

    /// Resolve each observation of one receiver epoch, or buffer it until its ephemeris arrives.
    pub fn ingest_observation_epoch(
        &mut self,
        node: NodeId,
        observations: &[GnssObservation],
    ) -> EpochOutcome {
        let mut outcome = EpochOutcome::default();
        for obs in observations {
            if obs.snr < self.config.min_snr {
                outcome.dropped.push(DroppedObservation {
                    node,
                    sat: obs.satellite,
                    reason: FusionError::InvalidMeasurement(format!(
                        "SNR {:.1} below mask {:.1}",
                        obs.snr, self.config.min_snr
                    )),
                });
                continue;
            }
            match self.usable_ephemeris(obs) {
                Some(eph) => outcome.resolved.push(resolve(eph, node, obs)),
                None => {
                    self.pending.push(PendingObservation {
                        node,
                        obs: obs.clone(),
                    });
                    outcome.buffered += 1;
                }
            }
        }
        outcome
    }

    /// Drop buffered observations older than the wait timeout at `now`
    pub fn expire(&mut self, now: GnssTime) -> Vec<DroppedObservation> {
        let timeout = self.config.ephemeris_timeout;
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| now - p.obs.time > timeout);
        self.pending = kept;
        expired
            .into_iter()
            .map(|p| {
                log::warn!("dropping {} observation: no ephemeris within {timeout}s", p.obs.satellite);
                DroppedObservation {
                    node: p.node,
                    sat: p.obs.satellite,
                    reason: FusionError::UnresolvedEphemeris(p.obs.satellite),
                }
            })
            .collect()
    }

    /// Forget buffered observations tied to a node that left the window
    pub fn discard_node(&mut self, node: NodeId) -> Vec<DroppedObservation> {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.node == node);
        self.pending = kept;
        gone.into_iter()
            .map(|p| DroppedObservation {
                node,
                sat: p.obs.satellite,
                reason: FusionError::UnresolvedEphemeris(p.obs.satellite),
            })
            .collect()
    }

    fn usable_ephemeris(&self, obs: &GnssObservation) -> Option<&Ephemeris> {
        self.ephemerides
            .get(&obs.satellite)
            .filter(|eph| eph.is_valid_at(obs.time, self.config.max_ephemeris_age))
    }
}

/// Evaluate the satellite at the true transmission time.
///
/// Transmission time in satellite clock is the receive time minus the pseudorange flight time;
/// the satellite clock polynomial (itself solved iteratively) then maps it to true time.
fn resolve(eph: &Ephemeris, node: NodeId, obs: &GnssObservation) -> ResolvedObservation {
    let t_sv = obs.time - obs.pseudorange / SPEED_OF_LIGHT;
    let transmit_time = t_sv - eph.clock_polynomial(t_sv);
    ResolvedObservation {
        node,
        sat: obs.satellite,
        receive_time: obs.time,
        transmit_time,
        satellite: eph.satellite_state(transmit_time),
        pseudorange: obs.pseudorange,
        range_rate: -obs.doppler * LAMBDA_L1,
        carrier_phase: obs.carrier_phase,
        snr: obs.snr,
        lock_loss: obs.lock_loss,
    }
}

fn validate_ephemeris(eph: &Ephemeris) -> FusionResult<()> {
    let values = [
        eph.a, eph.e, eph.i0, eph.omega0, eph.omega, eph.m0, eph.delta_n, eph.omega_dot,
        eph.i_dot, eph.crc, eph.crs, eph.cuc, eph.cus, eph.cic, eph.cis, eph.f0, eph.f1, eph.f2,
    ];
    if values.iter().any(|v| !v.is_finite()) || !eph.toe.is_finite() || !eph.toc.is_finite() {
        return Err(FusionError::InvalidMeasurement(format!(
            "non-finite ephemeris for {}",
            eph.sat
        )));
    }
    if eph.a <= 0.0 || !(0.0..1.0).contains(&eph.e) {
        return Err(FusionError::InvalidMeasurement(format!(
            "ephemeris for {} has a non-elliptic orbit",
            eph.sat
        )));
    }
    Ok(())
}
