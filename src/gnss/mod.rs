//! GNSS observation handling: composite time, broadcast ephemerides, frames, the
//! ephemeris-matching processor and single-point positioning.

pub mod ephemeris;
pub mod frames;
pub mod positioning;
pub mod processor;
pub mod time;

use std::fmt;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

pub use ephemeris::{Ephemeris, SatelliteState};
pub use frames::LocalFrame;
pub use positioning::{point_position, PointFix};
pub use processor::{
    DroppedObservation, EpochOutcome, GnssProcessor, GnssProcessorConfig, ResolvedObservation,
};
pub use time::GnssTime;

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;
pub const GM_EARTH: f64 = 3.986_005e14;
pub const EARTH_ROTATION_RATE: f64 = 7.292_115_146_7e-5;
pub const FREQ_L1: f64 = 1.575_42e9;
pub const LAMBDA_L1: f64 = SPEED_OF_LIGHT / FREQ_L1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SatelliteId(pub u16);

impl fmt::Display for SatelliteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{:02}", self.0)
    }
}

/// One satellite's raw observation within a receiver epoch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GnssObservation {
    /// Receiver time of reception
    pub time: GnssTime,
    pub satellite: SatelliteId,
    pub receiver: u8,
    /// Signal-to-noise ratio [dB-Hz]
    pub snr: f64,
    /// Loss-of-lock indicator
    pub lock_loss: bool,
    pub signal_code: u8,
    /// [m]
    pub pseudorange: f64,
    /// [Hz]
    pub doppler: f64,
    /// [cycles]
    pub carrier_phase: f64,
}

impl GnssObservation {
    pub fn is_finite(&self) -> bool {
        self.time.is_finite()
            && self.pseudorange.is_finite()
            && self.doppler.is_finite()
            && self.carrier_phase.is_finite()
            && self.snr.is_finite()
    }
}

/// Geometric range including the Earth-rotation (Sagnac) correction
pub fn sagnac_range(satellite: &Vector3<f64>, receiver: &Vector3<f64>) -> f64 {
    (satellite - receiver).norm()
        + EARTH_ROTATION_RATE * (satellite[0] * receiver[1] - satellite[1] * receiver[0])
            / SPEED_OF_LIGHT
}
