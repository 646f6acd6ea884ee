//! WGS-84 ECEF / geodetic / local ENU conversions

use nalgebra::{Matrix3, Vector3};

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Geodetic (latitude [rad], longitude [rad], height [m]) to ECEF
pub fn lla_to_ecef(lla: &Vector3<f64>) -> Vector3<f64> {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let (sin_lat, cos_lat) = lla[0].sin_cos();
    let (sin_lon, cos_lon) = lla[1].sin_cos();
    let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    Vector3::new(
        (n + lla[2]) * cos_lat * cos_lon,
        (n + lla[2]) * cos_lat * sin_lon,
        (n * (1.0 - e2) + lla[2]) * sin_lat,
    )
}

/// ECEF to geodetic (latitude [rad], longitude [rad], height [m])
pub fn ecef_to_lla(ecef: &Vector3<f64>) -> Vector3<f64> {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let r2 = ecef[0] * ecef[0] + ecef[1] * ecef[1];
    let mut z = ecef[2];
    let mut zk = 0.0;
    let mut n = WGS84_A;
    for _ in 0..20 {
        if (z - zk).abs() < 1e-4 {
            break;
        }
        zk = z;
        let sin_lat = z / (r2 + z * z).sqrt();
        n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        z = ecef[2] + n * e2 * sin_lat;
    }
    let lat = if r2 > 1e-12 {
        (z / r2.sqrt()).atan()
    } else if ecef[2] > 0.0 {
        std::f64::consts::FRAC_PI_2
    } else {
        -std::f64::consts::FRAC_PI_2
    };
    let lon = if r2 > 1e-12 { ecef[1].atan2(ecef[0]) } else { 0.0 };
    Vector3::new(lat, lon, (r2 + z * z).sqrt() - n)
}

/// Rotation taking ENU vectors at (lat, lon) into ECEF
pub fn enu_to_ecef_rotation(lat: f64, lon: f64) -> Matrix3<f64> {
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    Matrix3::new(
        -sin_lon, -sin_lat * cos_lon, cos_lat * cos_lon,
        cos_lon, -sin_lat * sin_lon, cos_lat * sin_lon,
        0.0, cos_lat, sin_lat,
    )
}

/// Local ENU frame anchored at an ECEF origin
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalFrame {
    pub origin_ecef: Vector3<f64>,
    pub enu_to_ecef: Matrix3<f64>,
}

impl LocalFrame {
    pub fn from_ecef(origin_ecef: Vector3<f64>) -> Self {
        let lla = ecef_to_lla(&origin_ecef);
        Self {
            origin_ecef,
            enu_to_ecef: enu_to_ecef_rotation(lla[0], lla[1]),
        }
    }

    pub fn from_lla(lla: &Vector3<f64>) -> Self {
        Self {
            origin_ecef: lla_to_ecef(lla),
            enu_to_ecef: enu_to_ecef_rotation(lla[0], lla[1]),
        }
    }

    pub fn point_to_ecef(&self, enu: &Vector3<f64>) -> Vector3<f64> {
        self.origin_ecef + self.enu_to_ecef * enu
    }

    pub fn point_to_enu(&self, ecef: &Vector3<f64>) -> Vector3<f64> {
        self.enu_to_ecef.transpose() * (ecef - self.origin_ecef)
    }

    pub fn vector_to_ecef(&self, enu: &Vector3<f64>) -> Vector3<f64> {
        self.enu_to_ecef * enu
    }
}
