//! Broadcast ephemeris and satellite state evaluation
//!
//! GPS-style Keplerian elements with harmonic corrections (IS-GPS-200 user algorithm).

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::time::GnssTime;
use super::{SatelliteId, EARTH_ROTATION_RATE, GM_EARTH, SPEED_OF_LIGHT};

/// Step used to difference position and clock into velocity and drift [s]
const DIFF_STEP: f64 = 1e-3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ephemeris {
    pub sat: SatelliteId,
    pub iode: i32,
    pub iodc: i32,
    /// Satellite health flag, zero when usable
    pub health: i32,
    pub week: i32,
    /// Time of ephemeris
    pub toe: GnssTime,
    /// Time of clock
    pub toc: GnssTime,
    /// Transmission time of message
    pub ttr: GnssTime,

    /// Semi-major axis [m]
    pub a: f64,
    pub e: f64,
    pub i0: f64,
    pub omega0: f64,
    /// Argument of perigee
    pub omega: f64,
    pub m0: f64,
    pub delta_n: f64,
    pub omega_dot: f64,
    pub i_dot: f64,
    pub crc: f64,
    pub crs: f64,
    pub cuc: f64,
    pub cus: f64,
    pub cic: f64,
    pub cis: f64,

    /// Clock polynomial [s, s/s, s/s²]
    pub f0: f64,
    pub f1: f64,
    pub f2: f64,
    /// Group delays [s]
    pub tgd: [f64; 4],
    /// Curve-fit interval [hours], zero when unknown
    pub fit_hours: f64,
}

/// Satellite position, velocity and clock at one instant
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SatelliteState {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    /// Clock bias [s], group delay removed
    pub clock_bias: f64,
    /// Clock drift [s/s]
    pub clock_drift: f64,
}

impl Ephemeris {
    /// True when `self` should replace `other` for the same satellite
    pub fn supersedes(&self, other: &Ephemeris) -> bool {
        if self.toe > other.toe {
            return true;
        }
        self.toe == other.toe && self.iode != other.iode && self.ttr > other.ttr
    }

    /// True when the record is healthy and `t` is inside its validity window
    pub fn is_valid_at(&self, t: GnssTime, max_age: f64) -> bool {
        let age = if self.fit_hours > 0.0 {
            max_age.min(self.fit_hours * 3600.0)
        } else {
            max_age
        };
        self.health == 0 && (t - self.toe).abs() <= age
    }

    /// Satellite clock bias from the polynomial alone, solved at satellite time `t`
    ///
    /// The polynomial is referenced to true time, so the argument is refined twice.
    pub fn clock_polynomial(&self, t: GnssTime) -> f64 {
        let ts = t - self.toc;
        let mut tk = ts;
        for _ in 0..2 {
            tk = ts - (self.f0 + self.f1 * tk + self.f2 * tk * tk);
        }
        self.f0 + self.f1 * tk + self.f2 * tk * tk
    }

    /// ECEF position and full clock bias (polynomial + relativity - TGD) at true time `t`
    pub fn position_and_clock(&self, t: GnssTime) -> (Vector3<f64>, f64) {
        let tk = t - self.toe;
        let n0 = (GM_EARTH / (self.a * self.a * self.a)).sqrt();
        let n = n0 + self.delta_n;
        let m = self.m0 + n * tk;

        let mut ecc_anomaly = m;
        for _ in 0..30 {
            let prev = ecc_anomaly;
            ecc_anomaly -= (ecc_anomaly - self.e * ecc_anomaly.sin() - m)
                / (1.0 - self.e * ecc_anomaly.cos());
            if (ecc_anomaly - prev).abs() < 1e-13 {
                break;
            }
        }
        let (sin_e, cos_e) = ecc_anomaly.sin_cos();

        let mut u = ((1.0 - self.e * self.e).sqrt() * sin_e).atan2(cos_e - self.e) + self.omega;
        let mut r = self.a * (1.0 - self.e * cos_e);
        let mut inc = self.i0 + self.i_dot * tk;
        let (sin_2u, cos_2u) = (2.0 * u).sin_cos();
        u += self.cus * sin_2u + self.cuc * cos_2u;
        r += self.crs * sin_2u + self.crc * cos_2u;
        inc += self.cis * sin_2u + self.cic * cos_2u;

        let x = r * u.cos();
        let y = r * u.sin();
        let cos_i = inc.cos();
        let node = self.omega0 + (self.omega_dot - EARTH_ROTATION_RATE) * tk
            - EARTH_ROTATION_RATE * self.toe.tow();
        let (sin_o, cos_o) = node.sin_cos();

        let position = Vector3::new(
            x * cos_o - y * cos_i * sin_o,
            x * sin_o + y * cos_i * cos_o,
            y * inc.sin(),
        );

        let tc = t - self.toc;
        let relativity =
            -2.0 * (GM_EARTH * self.a).sqrt() * self.e * sin_e / (SPEED_OF_LIGHT * SPEED_OF_LIGHT);
        let clock = self.f0 + self.f1 * tc + self.f2 * tc * tc + relativity - self.tgd[0];
        (position, clock)
    }

    /// Position, velocity, clock bias and drift at true time `t`
    pub fn satellite_state(&self, t: GnssTime) -> SatelliteState {
        let (p0, c0) = self.position_and_clock(t);
        let (p1, c1) = self.position_and_clock(t + DIFF_STEP);
        SatelliteState {
            position: p0,
            velocity: (p1 - p0) / DIFF_STEP,
            clock_bias: c0,
            clock_drift: (c1 - c0) / DIFF_STEP,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A plausible GPS record (circular-ish MEO orbit)
    pub(crate) fn sample_ephemeris(sat: u16, toe: GnssTime) -> Ephemeris {
        Ephemeris {
            sat: SatelliteId(sat),
            iode: 10,
            iodc: 10,
            health: 0,
            week: toe.week(),
            toe,
            toc: toe,
            ttr: toe - 30.0,
            a: 26_560_000.0,
            e: 0.01,
            i0: 0.96,
            omega0: 0.3 * sat as f64,
            omega: 0.5,
            m0: 0.7 * sat as f64,
            delta_n: 4.5e-9,
            omega_dot: -8.0e-9,
            i_dot: 1.0e-10,
            crc: 200.0,
            crs: -30.0,
            cuc: -1.5e-6,
            cus: 8.0e-6,
            cic: 1.0e-7,
            cis: -5.0e-8,
            f0: 1.0e-4,
            f1: 1.0e-11,
            f2: 0.0,
            tgd: [5.0e-9, 0.0, 0.0, 0.0],
            fit_hours: 4.0,
        }
    }

    #[test]
    fn test_orbit_radius_is_meo() {
        let toe = GnssTime::from_week_tow(2200, 7200.0);
        let eph = sample_ephemeris(3, toe);
        let state = eph.satellite_state(toe + 600.0);
        let radius = state.position.norm();
        assert!(radius > 26_000_000.0 && radius < 27_200_000.0);
        // Speed in ECEF for GPS orbits is roughly 3 km/s
        let speed = state.velocity.norm();
        assert!(speed > 1_000.0 && speed < 4_500.0, "speed {speed}");
        assert!((state.clock_bias - 1.0e-4).abs() < 1e-6);
        assert!((state.clock_drift - 1.0e-11).abs() < 1e-9);
    }

    #[test]
    fn test_validity_window() {
        let toe = GnssTime::from_week_tow(2200, 7200.0);
        let eph = sample_ephemeris(3, toe);
        assert!(eph.is_valid_at(toe + 3600.0, 4.0 * 3600.0));
        assert!(!eph.is_valid_at(toe + 5.0 * 3600.0, 4.0 * 3600.0));
        let mut sick = eph.clone();
        sick.health = 1;
        assert!(!sick.is_valid_at(toe, 4.0 * 3600.0));
    }

    #[test]
    fn test_supersedes() {
        let toe = GnssTime::from_week_tow(2200, 7200.0);
        let old = sample_ephemeris(3, toe);
        let newer = sample_ephemeris(3, toe + 7200.0);
        assert!(newer.supersedes(&old));
        assert!(!old.supersedes(&newer));
        assert!(!old.supersedes(&old.clone()));
    }
}
